//! Integration tests for configuration loading

use std::io::Write;

use vdocap::capture::PixelFormat;
use vdocap::{CaptureConfig, Config};

#[test]
fn test_defaults_without_file() {
    let config = Config::load(None).unwrap();
    assert_eq!(config.capture, CaptureConfig::default());
    assert_eq!(config.capture.format, PixelFormat::Rgb3);
    assert_eq!(config.logging.filter, "vdocap=info");
    assert!(config.demo.snapshot.is_none());
}

#[test]
fn test_toml_overrides_selected_fields() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[capture]
width = 1280
height = 720
format = "y800"
max_stale_drops = 4

[capture.crop]
x = 10
y = 20
width = 640
height = 360

[demo]
frames = 5
snapshot = "/tmp/frame.png"
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.capture.width, 1280);
    assert_eq!(config.capture.height, 720);
    assert_eq!(config.capture.format, PixelFormat::Y800);
    assert_eq!(config.capture.max_stale_drops, Some(4));
    assert_eq!(config.capture.crop.map(|c| c.width), Some(640));
    // Untouched fields keep their defaults
    assert_eq!(config.capture.fps, 30);
    assert_eq!(config.capture.buffer_count, 3);
    assert_eq!(config.demo.frames, 5);
    assert_eq!(
        config.demo.snapshot.as_deref(),
        Some(std::path::Path::new("/tmp/frame.png"))
    );
}

#[test]
fn test_unknown_format_is_rejected() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[capture]\nformat = \"yuyv\"").unwrap();

    assert!(Config::load(Some(file.path())).is_err());
}
