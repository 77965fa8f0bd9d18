//! Build script
//!
//! Only does work when the `libmtp` feature is enabled: locates the system
//! libmtp (honouring `LIBMTP_LIB_DIR`), emits the link directives and
//! generates Rust bindings from its `libmtp.h` (honouring `LIBMTP_INCLUDE_DIR`).

use std::env;
use std::path::{Path, PathBuf};

fn has_libmtp(dir: &Path) -> bool {
    dir.join("libmtp.so").exists()
        || dir.join("libmtp.dylib").exists()
        || dir.join("libmtp.a").exists()
}

/// Directory holding the library, if one was given or found
fn link_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("LIBMTP_LIB_DIR") {
        let dir = PathBuf::from(dir);
        if !has_libmtp(&dir) {
            println!(
                "cargo:warning=LIBMTP_LIB_DIR={} does not contain libmtp",
                dir.display()
            );
        }
        return Some(dir);
    }

    let candidates = [
        "/usr/lib",
        "/usr/local/lib",
        "/usr/lib/x86_64-linux-gnu",
        "/usr/lib/aarch64-linux-gnu",
        "/opt/homebrew/lib",
    ];
    let found = candidates
        .iter()
        .map(PathBuf::from)
        .find(|dir| has_libmtp(dir));
    if found.is_none() {
        println!("cargo:warning=libmtp not found in standard locations; set LIBMTP_LIB_DIR");
    }
    found
}

/// Header search path: `LIBMTP_INCLUDE_DIR`, else `include/` next to the library
fn include_dir(lib_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = env::var_os("LIBMTP_INCLUDE_DIR") {
        return Some(PathBuf::from(dir));
    }
    lib_dir
        .and_then(|dir| {
            dir.ancestors()
                .map(|a| a.join("include"))
                .find(|inc| inc.join("libmtp.h").exists())
        })
}

#[cfg(feature = "libmtp")]
fn generate_bindings(include: Option<&Path>) {
    let mut builder = bindgen::Builder::default()
        .header_contents("libmtp_wrapper.h", "#include <libmtp.h>\n")
        .allowlist_function("LIBMTP_.*")
        .allowlist_type("LIBMTP_.*")
        .allowlist_var("LIBMTP_.*")
        .default_enum_style(bindgen::EnumVariation::Consts)
        .prepend_enum_name(false)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()));
    if let Some(dir) = include {
        builder = builder.clang_arg(format!("-I{}", dir.display()));
    }

    let bindings = match builder.generate() {
        Ok(bindings) => bindings,
        Err(e) => panic!(
            "unable to generate libmtp bindings ({}); install the libmtp headers or set LIBMTP_INCLUDE_DIR",
            e
        ),
    };

    let out = match env::var_os("OUT_DIR") {
        Some(dir) => PathBuf::from(dir).join("libmtp_bindings.rs"),
        None => panic!("OUT_DIR is not set"),
    };
    if let Err(e) = bindings.write_to_file(&out) {
        panic!("unable to write {}: {}", out.display(), e);
    }
}

#[cfg(not(feature = "libmtp"))]
fn generate_bindings(_include: Option<&Path>) {}

fn main() {
    println!("cargo:rerun-if-env-changed=LIBMTP_LIB_DIR");
    println!("cargo:rerun-if-env-changed=LIBMTP_INCLUDE_DIR");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LIBMTP");

    if env::var_os("CARGO_FEATURE_LIBMTP").is_none() {
        return;
    }

    let lib_dir = link_dir();
    if let Some(dir) = &lib_dir {
        println!("cargo:rustc-link-search=native={}", dir.display());
    }
    println!("cargo:rustc-link-lib=mtp");

    generate_bindings(include_dir(lib_dir.as_deref()).as_deref());
}
