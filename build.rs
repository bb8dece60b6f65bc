// Build script to compile the GLSL integration kernels to SPIR-V

use std::path::Path;
use std::process::Command;

const KERNELS: [&str; 3] = ["func1", "func2", "func3"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile kernels using glslc (part of Vulkan SDK)
    for kernel in KERNELS {
        compile_shader(
            &format!("shaders/{kernel}.comp"),
            &format!("shaders/{kernel}.comp.spv"),
        );
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // Check if glslc is available
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.2")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}); {} was not compiled", e, input);
            println!("cargo:warning=install the Vulkan SDK or run: glslc {} -o {}", input, output);
        }
    }
}
