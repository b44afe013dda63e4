use std::env;
use std::path::Path;

/// Link `Info.plist` into `__TEXT,__info_plist` on macOS targets.
///
/// CoreBluetooth reads the Bluetooth usage string from that section when the
/// binary is not inside an app bundle; without it scanning stays unauthorised.
fn embed_info_plist(manifest_dir: &Path) {
    let plist = manifest_dir.join("Info.plist");
    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rustc-link-arg={}", plist.display());
    println!("cargo:rerun-if-changed=Info.plist");
}

fn main() {
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "macos" {
        return;
    }
    match env::var_os("CARGO_MANIFEST_DIR") {
        Some(dir) => embed_info_plist(Path::new(&dir)),
        None => println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded"),
    }
}
