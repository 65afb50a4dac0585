// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use std::fmt;

use crate::{
    image::{LoadError, PatchError, PatchableImage},
    region::{AllocError, ExecutableRegion},
    template::CodeTemplate,
};

/// One loaded [`PatchableImage`] for the lifetime of an interactive
/// session. This is the whole surface the shell drives: invoke the code,
/// patch its constant, shut down.
pub struct Session {
    image: PatchableImage,
}

#[derive(Debug)]
pub enum InitError {
    Alloc(AllocError),
    Load(LoadError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Alloc(error) => error.fmt(f),
            InitError::Load(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::Alloc(error) => Some(error),
            InitError::Load(error) => Some(error),
        }
    }
}

impl Session {
    /// Maps a region sized to `template` and loads it, ready to invoke.
    pub fn init(template: CodeTemplate) -> Result<Session, InitError> {
        let region = ExecutableRegion::of_size(template.len())
            .map_err(InitError::Alloc)?;
        let image =
            PatchableImage::load(template, region).map_err(InitError::Load)?;
        Ok(Session { image })
    }

    /// Runs the loaded code on `a` and `b`.
    pub fn invoke(&self, a: i32, b: i32) -> i32 {
        self.image.invoke(a, b)
    }

    /// Rewrites the constant embedded in the loaded code. A failure here
    /// is fatal to the session; see [`PatchError::ProtectFailed`].
    pub fn patch(&mut self, new_value: i32) -> Result<(), PatchError> {
        self.image.patch_constant(new_value)
    }

    /// The constant currently baked into the loaded code.
    pub fn constant(&self) -> i32 {
        self.image.constant()
    }

    /// Releases the mapping. Dropping the session does the same; this
    /// only exists to make the release point explicit at call sites.
    pub fn shutdown(self) {}
}
