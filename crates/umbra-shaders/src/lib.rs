//! Shaders of the Umbra renderer.
//!
//! GLSL sources live in `shaders/` and are compiled to SPIR-V at build time
//! using shaderc. The meshlet mesh shader is compiled twice: once writing
//! visibility-buffer IDs and once depth-only for shadow rasterization.

use std::sync::OnceLock;

/// Embedded SPIR-V shader bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    pub static MESHLET_VISBUFFER: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/meshlet_visbuffer.spv"));
    pub static MESHLET_DEPTH: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/meshlet_depth.spv"));
    pub static VISBUFFER_FRAG: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/visbuffer_frag.spv"));
    pub static VSM_CLASSIFY: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vsm_classify.spv"));
    pub static VSM_RESOLVE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/vsm_resolve.spv"));
    pub static COMPOSITE_VERT: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/composite_vert.spv"));
    pub static COMPOSITE_FRAG: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/composite_frag.spv"));
}

/// Convert byte slice to aligned u32 Vec (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    debug_assert!(bytes.len() % 4 == 0, "SPIR-V bytecode must be 4-byte aligned");
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

macro_rules! shader_getter {
    ($(#[$doc:meta])* $name:ident, $bytes:ident) => {
        $(#[$doc])*
        pub fn $name() -> &'static [u32] {
            static SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
            SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::$bytes))
        }
    };
}

shader_getter!(
    /// Mesh shader writing per-primitive visibility IDs.
    meshlet_visbuffer_mesh,
    MESHLET_VISBUFFER
);
shader_getter!(
    /// Depth-only mesh shader used for clipmap levels.
    meshlet_depth_mesh,
    MESHLET_DEPTH
);
shader_getter!(visbuffer_fragment, VISBUFFER_FRAG);
shader_getter!(
    /// Marks the virtual pages the main view needs.
    vsm_classify_compute,
    VSM_CLASSIFY
);
shader_getter!(
    /// Shades the visibility buffer with clipmap shadows.
    vsm_resolve_compute,
    VSM_RESOLVE
);
shader_getter!(composite_vertex, COMPOSITE_VERT);
shader_getter!(composite_fragment, COMPOSITE_FRAG);

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn all_shaders_load() {
        let shaders = [
            meshlet_visbuffer_mesh(),
            meshlet_depth_mesh(),
            visbuffer_fragment(),
            vsm_classify_compute(),
            vsm_resolve_compute(),
            composite_vertex(),
            composite_fragment(),
        ];
        for shader in shaders {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(shader.len() > 20, "Shader too small");
        }
    }

    #[test]
    fn depth_variant_differs_from_visbuffer_variant() {
        assert_ne!(meshlet_depth_mesh(), meshlet_visbuffer_mesh());
    }
}
