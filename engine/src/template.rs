// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use std::fmt;

#[cfg(target_arch = "x86_64")]
use static_assertions::const_assert;

/// Width in bytes of the patchable constant: one little-endian [`i32`].
pub const CONSTANT_WIDTH: usize = 4;

// The built-in function, compiled by hand:
//
//     add  edi, esi      ; 01 f7
//     imul eax, edi, C   ; 69 c7 <C as i32, little endian>
//     ret                ; c3
//
// which is `(a + b) * C` under System V, with C starting at 1.
#[cfg(target_arch = "x86_64")]
const ADD_MUL_CODE: [u8; 9] =
    [0x01, 0xf7, 0x69, 0xc7, 0x01, 0x00, 0x00, 0x00, 0xc3];

#[cfg(target_arch = "x86_64")]
const ADD_MUL_CONSTANT_OFFSET: usize = 4;

#[cfg(target_arch = "x86_64")]
const_assert!(ADD_MUL_CONSTANT_OFFSET + CONSTANT_WIDTH <= ADD_MUL_CODE.len());

/// An instruction sequence with one embedded, patchable [`i32`] field.
///
/// The bytes are opaque to everything downstream: nothing disassembles
/// them or checks that they form well-formed instructions. The only
/// structure a template carries is the byte range of its constant.
#[derive(Debug)]
pub struct CodeTemplate {
    bytes: Vec<u8>,
    constant_offset: usize,
}

/// A template whose constant field is not wholly inside its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateError {
    FieldOutOfBounds { offset: usize, len: usize },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::FieldOutOfBounds { offset, len } => write!(
                f,
                "constant field at offset {offset} does not fit in {len} template bytes"
            ),
        }
    }
}

impl std::error::Error for TemplateError {}

impl CodeTemplate {
    /// Wraps raw machine code together with the location of its patchable
    /// constant.
    ///
    /// # Safety
    ///
    /// Loading the template makes `bytes` callable as an
    /// [`EntryFn`](crate::region::EntryFn); the caller vouches that the
    /// bytes are exactly that for the host.
    pub unsafe fn from_raw(
        bytes: Vec<u8>,
        constant_offset: usize,
    ) -> Result<CodeTemplate, TemplateError> {
        let fits = constant_offset
            .checked_add(CONSTANT_WIDTH)
            .is_some_and(|end| end <= bytes.len());
        if !fits {
            return Err(TemplateError::FieldOutOfBounds {
                offset: constant_offset,
                len: bytes.len(),
            });
        }
        Ok(CodeTemplate {
            bytes,
            constant_offset,
        })
    }

    /// The built-in function `(a, b) -> (a + b) * C`, with `C` initially 1.
    #[cfg(target_arch = "x86_64")]
    pub fn add_mul() -> CodeTemplate {
        CodeTemplate {
            bytes: ADD_MUL_CODE.to_vec(),
            constant_offset: ADD_MUL_CONSTANT_OFFSET,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte offset of the constant field inside the template.
    pub fn constant_offset(&self) -> usize {
        self.constant_offset
    }

    /// The constant encoded in the template data itself, before any
    /// patching of a loaded copy.
    pub fn initial_constant(&self) -> i32 {
        let field = &self.bytes
            [self.constant_offset..self.constant_offset + CONSTANT_WIDTH];
        i32::from_le_bytes(
            field
                .try_into()
                .expect("field width is checked at construction"),
        )
    }
}
