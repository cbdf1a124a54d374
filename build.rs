use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// Set ONNXRUNTIME_DIRECTML_DIR to a folder holding onnxruntime.dll and DirectML.dll
// to have them staged next to the binary on Windows builds.
const DLL_DIR_VAR: &str = "ONNXRUNTIME_DIRECTML_DIR";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed={DLL_DIR_VAR}");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("windows") {
        if let Err(err) = copy_directml_dlls() {
            println!("cargo:warning=Failed to copy DirectML DLLs: {err}");
        }
    }
}

fn copy_directml_dlls() -> std::io::Result<()> {
    let Some(src_dir) = env::var_os(DLL_DIR_VAR).map(PathBuf::from) else {
        return Ok(());
    };
    if !src_dir.exists() {
        println!("cargo:warning={DLL_DIR_VAR} does not exist: {}", src_dir.display());
        return Ok(());
    }
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap_or_default());
    let target_dir = out_dir
        .parent()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "missing target dir"))?;
    let dest_dir = target_dir.join("onnxruntime");
    fs::create_dir_all(&dest_dir)?;
    for entry in fs::read_dir(&src_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()).unwrap_or("") != "dll" {
            continue;
        }
        fs::copy(&path, dest_dir.join(entry.file_name()))?;
    }
    Ok(())
}
