// Windowing backends
//
// Each submodule is one windowing system: its surface, its
// capability queries, and (where in scope) its presenter. The
// registry here is what instance creation consults to decide which
// backend a surface request maps to and which extension names can
// never work on this platform.
//
// Austin Shafer - 2025
pub mod headless;

#[cfg(feature = "drm")]
pub mod display;

#[cfg(feature = "wayland")]
pub mod wayland;

/// Surface extensions that can never be supported on this platform.
/// Requests for these are filtered out during instance creation.
pub static UNSUPPORTED_SURFACE_EXTENSIONS: [&str; 3] = [
    "VK_KHR_win32_surface",
    "VK_EXT_metal_surface",
    "VK_KHR_android_surface",
];

/// The windowing systems this layer knows about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendType {
    Headless,
    /// DRM/KMS display plane
    Display,
    Wayland,
    /// Known but the presenter lives out of tree
    X11,
}

impl BackendType {
    pub fn name(&self) -> &'static str {
        match self {
            BackendType::Headless => "headless",
            BackendType::Display => "display",
            BackendType::Wayland => "wayland",
            BackendType::X11 => "x11",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "headless" => Some(BackendType::Headless),
            "display" => Some(BackendType::Display),
            "wayland" => Some(BackendType::Wayland),
            "x11" => Some(BackendType::X11),
            _ => None,
        }
    }

    /// Whether this build carries a presenter for the backend.
    pub fn is_available(&self) -> bool {
        match self {
            BackendType::Headless => true,
            BackendType::Display => cfg!(feature = "drm"),
            BackendType::Wayland => false,
            BackendType::X11 => false,
        }
    }
}

/// Is this surface extension one we could ever serve?
pub fn is_surface_extension_supported(name: &str) -> bool {
    !UNSUPPORTED_SURFACE_EXTENSIONS.contains(&name)
}

/// Drop the surface extensions we can never support from an
/// instance extension request.
pub fn filter_unsupported_extensions(names: &mut Vec<String>) {
    names.retain(|name| is_surface_extension_supported(name));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_extensions_filtered() {
        let mut names = vec![
            "VK_KHR_surface".to_string(),
            "VK_KHR_win32_surface".to_string(),
            "VK_EXT_metal_surface".to_string(),
        ];
        filter_unsupported_extensions(&mut names);
        assert_eq!(names, vec!["VK_KHR_surface".to_string()]);
    }

    #[test]
    fn backend_names_round_trip() {
        for backend in [
            BackendType::Headless,
            BackendType::Display,
            BackendType::Wayland,
            BackendType::X11,
        ] {
            assert_eq!(BackendType::from_name(backend.name()), Some(backend));
        }
        assert!(BackendType::from_name("win32").is_none());
        assert!(BackendType::Headless.is_available());
    }
}
