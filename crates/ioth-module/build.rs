//! Build script for ioth-module
//!
//! Compiles `fixtures/ioth_fixture.c` into a shared object used by the
//! module loader tests and exports its path as `IOTH_FIXTURE_SO`. When no
//! C compiler is available the build continues and those tests skip.

use std::env;
use std::path::PathBuf;

const FIXTURE_SRC: &str = "fixtures/ioth_fixture.c";

fn main() {
    println!("cargo:rerun-if-changed={}", FIXTURE_SRC);

    if env::var_os("CARGO_CFG_UNIX").is_none() {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let so = out_dir.join("ioth_fixture.so");

    let compiler = match cc::Build::new()
        .pic(true)
        .opt_level(1)
        .warnings(false)
        .try_get_compiler()
    {
        Ok(compiler) => compiler,
        Err(e) => {
            println!("cargo:warning=fixture module not built: {}", e);
            return;
        }
    };

    let status = compiler
        .to_command()
        .arg("-shared")
        .arg("-o")
        .arg(&so)
        .arg(FIXTURE_SRC)
        .status();
    match status {
        Ok(s) if s.success() => {
            println!("cargo:rustc-env=IOTH_FIXTURE_SO={}", so.display());
        }
        Ok(s) => println!("cargo:warning=fixture module not built: compiler exited with {}", s),
        Err(e) => println!("cargo:warning=fixture module not built: {}", e),
    }
}
