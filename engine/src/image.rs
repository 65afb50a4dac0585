// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use std::fmt;

use crate::{
    region::{ExecutableRegion, ProtectError},
    template::{CodeTemplate, CONSTANT_WIDTH},
};

/// A [`CodeTemplate`] loaded into an [`ExecutableRegion`] it exclusively
/// owns. Every rewrite of the embedded constant goes through the region's
/// protection protocol, so the loaded copy is never writable and callable
/// at the same time.
pub struct PatchableImage {
    template: CodeTemplate,
    region: ExecutableRegion,
}

#[derive(Debug)]
pub enum LoadError {
    /// The region cannot hold the template. Raised before any protection
    /// change or copy is attempted.
    TooSmall { region: usize, template: usize },
    Protect(ProtectError),
}

impl From<ProtectError> for LoadError {
    fn from(value: ProtectError) -> Self {
        LoadError::Protect(value)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::TooSmall { region, template } => write!(
                f,
                "template needs {template} bytes but the region only has {region}"
            ),
            LoadError::Protect(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::TooSmall { .. } => None,
            LoadError::Protect(error) => Some(error),
        }
    }
}

#[derive(Debug)]
pub enum PatchError {
    /// A protection change was refused while patching. If the refusal hit
    /// the transition back to executable, the region is stuck writable and
    /// the image is dead; callers are expected to abort, not retry.
    ProtectFailed(ProtectError),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::ProtectFailed(error) => {
                write!(f, "protection change refused while patching: {error}")
            }
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::ProtectFailed(error) => Some(error),
        }
    }
}

impl PatchableImage {
    /// Copies `template` into `region` and seals the region executable.
    ///
    /// Consumes the region: once an image exists, the only mutation path
    /// left is [`Self::patch_constant`].
    pub fn load(
        template: CodeTemplate,
        mut region: ExecutableRegion,
    ) -> Result<PatchableImage, LoadError> {
        if region.size() < template.len() {
            return Err(LoadError::TooSmall {
                region: region.size(),
                template: template.len(),
            });
        }
        region.set_writable()?;
        region.as_bytes_mut()[..template.len()]
            .copy_from_slice(template.bytes());
        region.set_executable()?;
        Ok(PatchableImage { template, region })
    }

    /// Runs the loaded code with the given arguments.
    pub fn invoke(&self, a: i32, b: i32) -> i32 {
        // SAFETY: construction copied in bytes vouched to be an `EntryFn`
        // (see `CodeTemplate::from_raw`) and left the region executable.
        unsafe { self.region.call(a, b) }
    }

    /// Rewrites the embedded constant to `new_value`.
    ///
    /// The write happens only after the region is writable again, so a
    /// refused first transition leaves the previous constant, and the
    /// previous behavior, fully intact. A refused second transition leaves
    /// the region writable and the image permanently unusable.
    pub fn patch_constant(
        &mut self,
        new_value: i32,
    ) -> Result<(), PatchError> {
        self.region
            .set_writable()
            .map_err(PatchError::ProtectFailed)?;
        let offset = self.template.constant_offset();
        self.region.as_bytes_mut()[offset..offset + CONSTANT_WIDTH]
            .copy_from_slice(&new_value.to_le_bytes());
        self.region
            .set_executable()
            .map_err(PatchError::ProtectFailed)?;
        Ok(())
    }

    /// The constant currently baked into the loaded code.
    pub fn constant(&self) -> i32 {
        let offset = self.template.constant_offset();
        let field = &self.region.as_bytes()[offset..offset + CONSTANT_WIDTH];
        i32::from_le_bytes(
            field
                .try_into()
                .expect("field width is checked at construction"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{LoadError, PatchableImage};
    use crate::{
        region::{ExecutableRegion, Mode},
        template::CodeTemplate,
    };

    // Filler "code" that is loaded and sealed but never called, so these
    // tests run on any architecture.
    fn filler_template(len: usize, constant_offset: usize) -> CodeTemplate {
        unsafe { CodeTemplate::from_raw(vec![0; len], constant_offset) }
            .expect("the field lies within the bytes")
    }

    fn region_for(template: &CodeTemplate) -> ExecutableRegion {
        ExecutableRegion::of_size(template.len())
            .expect("mapping should succeed")
    }

    #[test]
    fn load_copies_the_template_and_seals_the_region() {
        let template = filler_template(16, 8);
        let region = region_for(&template);
        let image = PatchableImage::load(template, region)
            .expect("loading should succeed");

        assert_eq!(Mode::Executable, image.region.mode());
        assert_eq!(0, image.constant());
    }

    #[test]
    fn load_preserves_the_initial_constant() {
        let mut bytes = vec![0; 16];
        bytes[8..12].copy_from_slice(&123i32.to_le_bytes());
        let template = unsafe { CodeTemplate::from_raw(bytes, 8) }
            .expect("the field lies within the bytes");
        let initial = template.initial_constant();

        let region = region_for(&template);
        let image = PatchableImage::load(template, region)
            .expect("loading should succeed");
        assert_eq!(initial, image.constant());
        assert_eq!(123, image.constant());
    }

    #[test]
    fn oversized_template_is_rejected() {
        let probe = ExecutableRegion::of_size(1).expect("mapping should succeed");
        let page = probe.size();

        let template = filler_template(page + 1, 0);
        let region =
            ExecutableRegion::of_size(page).expect("mapping should succeed");
        match PatchableImage::load(template, region) {
            Err(LoadError::TooSmall { region, template }) => {
                assert_eq!(page, region);
                assert_eq!(page + 1, template);
            }
            Err(other) => panic!("expected TooSmall, got {other:?}"),
            Ok(_) => panic!("an oversized template should be rejected"),
        }
    }

    #[test]
    fn patch_rewrites_exactly_the_constant_field() {
        let template = filler_template(16, 8);
        let region = region_for(&template);
        let mut image = PatchableImage::load(template, region)
            .expect("loading should succeed");

        image.patch_constant(-559038737).expect("patching should succeed");

        assert_eq!(-559038737, image.constant());
        let bytes = image.region.as_bytes();
        assert!(bytes[..8].iter().all(|&byte| byte == 0));
        assert!(bytes[12..16].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn patch_round_trips_boundary_values() {
        let template = filler_template(16, 8);
        let region = region_for(&template);
        let mut image = PatchableImage::load(template, region)
            .expect("loading should succeed");

        for value in [0, 1, -1, 42, -42, i32::MIN, i32::MAX] {
            image.patch_constant(value).expect("patching should succeed");
            assert_eq!(value, image.constant());
            assert_eq!(Mode::Executable, image.region.mode());
        }
    }

    #[test]
    fn patch_leaves_no_writable_window_behind() {
        let template = filler_template(16, 8);
        let region = region_for(&template);
        let mut image = PatchableImage::load(template, region)
            .expect("loading should succeed");

        image.patch_constant(7).expect("patching should succeed");
        assert_eq!(Mode::Executable, image.region.mode());
    }
}
