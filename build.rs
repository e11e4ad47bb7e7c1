use std::{env, path::PathBuf};

fn main() {
    println!("cargo::rustc-check-cfg=cfg(bare_metal)");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_os != "none" || target_arch != "x86" {
        // Hosted builds only compile the parts of the kernel that can be tested on the host.
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let ld = manifest_dir.join("linker.ld");

    println!("cargo:rerun-if-changed={}", ld.display());
    println!("cargo:rustc-cfg=bare_metal");
    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());
}
