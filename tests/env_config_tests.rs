//! Environment layering for configuration loading.
//!
//! Kept in its own test binary: the variables set here are process-wide.

use std::io::Write;

use vdocap::Config;

#[test]
fn test_env_overrides_toml() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[capture]\nwidth = 640\nheight = 480").unwrap();

    std::env::set_var("VDOCAP__CAPTURE__WIDTH", "1280");
    std::env::set_var("VDOCAP__DEMO__FRAMES", "7");
    let config = Config::load(Some(file.path()));
    std::env::remove_var("VDOCAP__CAPTURE__WIDTH");
    std::env::remove_var("VDOCAP__DEMO__FRAMES");

    let config = config.unwrap();
    assert_eq!(config.capture.width, 1280);
    assert_eq!(config.capture.height, 480);
    assert_eq!(config.demo.frames, 7);
}
