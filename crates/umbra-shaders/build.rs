//! Build script to compile GLSL shaders to SPIR-V.

use shaderc::{Compiler, IncludeType, ResolvedInclude, ShaderKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

struct ShaderJob {
    source: &'static str,
    output: &'static str,
    kind: ShaderKind,
    defines: &'static [&'static str],
}

const SHADERS: &[ShaderJob] = &[
    ShaderJob {
        source: "meshlet.mesh",
        output: "meshlet_visbuffer.spv",
        kind: ShaderKind::Mesh,
        defines: &["VISBUFFER"],
    },
    ShaderJob {
        source: "meshlet.mesh",
        output: "meshlet_depth.spv",
        kind: ShaderKind::Mesh,
        defines: &[],
    },
    ShaderJob {
        source: "visbuffer.frag",
        output: "visbuffer_frag.spv",
        kind: ShaderKind::Fragment,
        defines: &[],
    },
    ShaderJob {
        source: "vsm_classify.comp",
        output: "vsm_classify.spv",
        kind: ShaderKind::Compute,
        defines: &[],
    },
    ShaderJob {
        source: "vsm_resolve.comp",
        output: "vsm_resolve.spv",
        kind: ShaderKind::Compute,
        defines: &[],
    },
    ShaderJob {
        source: "composite.vert",
        output: "composite_vert.spv",
        kind: ShaderKind::Vertex,
        defines: &[],
    },
    ShaderJob {
        source: "composite.frag",
        output: "composite_frag.spv",
        kind: ShaderKind::Fragment,
        defines: &[],
    },
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let shader_dir = Path::new("shaders");

    // Rerun if shaders change
    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for job in SHADERS {
        compile_shader(&compiler, shader_dir, job, &out_dir.join(job.output));
    }
}

fn compile_shader(compiler: &Compiler, shader_dir: &Path, job: &ShaderJob, output: &Path) {
    let input_path = shader_dir.join(job.source);
    let source = fs::read_to_string(&input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {input_path:?}: {e}"));

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_3 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_6);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    for define in job.defines {
        options.add_macro_definition(define, None);
    }

    let include_dir = shader_dir.to_path_buf();
    options.set_include_callback(move |name, _kind: IncludeType, _from, _depth| {
        let path = include_dir.join(name);
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read include {path:?}: {e}"))?;
        Ok(ResolvedInclude {
            resolved_name: path.display().to_string(),
            content,
        })
    });

    let result = compiler
        .compile_into_spirv(&source, job.kind, job.source, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {input_path:?}: {e}"));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {input_path:?}: {}",
            result.get_warning_messages()
        );
    }

    fs::write(output, bytemuck::cast_slice::<u32, u8>(result.as_binary()))
        .unwrap_or_else(|e| panic!("Failed to write shader {output:?}: {e}"));
}
