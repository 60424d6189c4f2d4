use std::path::PathBuf;
use std::process::Command;

fn main() {
    let is_ci = std::env::var("CI").is_ok();

    // Generate TypeScript types for the control API/WS protocol so the (external,
    // out-of-scope) browser UI has a typed contract to build against.
    let output_dir = PathBuf::from("target/generated");
    std::fs::create_dir_all(&output_dir).expect("Failed to create output directory");

    let status = Command::new("typeshare")
        .arg(".")
        .arg("--lang=typescript")
        .arg(format!("--output-file={}/index.ts", output_dir.display()))
        .status();

    match status {
        Ok(exit_status) if exit_status.success() => {
            println!("cargo:warning=TypeShare generation completed successfully");
        }
        Ok(exit_status) => {
            let msg = format!(
                "TypeShare CLI failed with status: {exit_status}. Install typeshare-cli: cargo install typeshare-cli"
            );
            if is_ci {
                panic!("{msg}");
            } else {
                println!("cargo:warning={msg}");
            }
        }
        Err(e) => {
            let msg = format!(
                "Failed to run TypeShare CLI: {e}. Install typeshare-cli: cargo install typeshare-cli"
            );
            if is_ci {
                panic!("{msg}");
            } else {
                println!("cargo:warning={msg}");
            }
        }
    }

    println!("cargo:rerun-if-changed=src/");
}
