use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use colordesc::kmeans::KMeansParams;
use colordesc::model::{ModelFiles, ModelParams, build_model};
use colordesc::{DescriptorKind, DescriptorType, Modality};
use ndarray::Array2;
use predicates::prelude::*;
use rstest::*;

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[fixture]
fn dirs() -> (assert_fs::TempDir, assert_fs::TempDir) {
    (assert_fs::TempDir::new().unwrap(), assert_fs::TempDir::new().unwrap())
}

#[test]
fn list_kinds() -> Result<()> {
    let output = cargo_run!("colordesc", "kinds").success().get_output().stdout.clone();
    let stdout = String::from_utf8(output)?;
    assert_eq!(stdout.lines().count(), 28);
    assert!(stdout.contains("ColorDescriptor_image_csift"));
    assert!(stdout.contains("ColorDescriptor_video_rgbhistogram"));
    Ok(())
}

#[test]
fn list_kinds_for_content_type() -> Result<()> {
    cargo_run!("colordesc", "kinds", "--content-type", "video/webm")
        .success()
        .stdout(predicate::str::contains("ColorDescriptor_video_sift"))
        .stdout(predicate::str::contains("_image_").not());

    cargo_run!("colordesc", "kinds", "--content-type", "image/gif").success().stdout(predicate::str::is_empty());
    Ok(())
}

#[rstest]
fn quantize_requires_model(dirs: (assert_fs::TempDir, assert_fs::TempDir)) -> Result<()> {
    let (model, work) = dirs;
    let image = work.child("a.png");
    image.write_binary(b"not really a png")?;

    cargo_run!("colordesc", "-m", model.path(), "-w", work.path(), "quantize", "-K", "sift", image.path())
        .failure()
        .stderr(predicate::str::contains("模型不存在"));
    Ok(())
}

#[rstest]
fn quantize_single_file_failure(dirs: (assert_fs::TempDir, assert_fs::TempDir)) -> Result<()> {
    let (model, work) = dirs;
    let files = ModelFiles::new(model.path(), work.path(), DescriptorType::new(DescriptorKind::Sift, Modality::Image));
    let params = ModelParams {
        kmeans: KMeansParams { k: 4, max_iter: 5, batch_size: 16, seed: Some(1) },
        ..Default::default()
    };
    build_model(&files, &params, || Ok(Array2::from_shape_fn((40, 8), |(i, j)| ((i % 4) * 10 + j) as f32)))?;
    assert!(files.has_model());

    let image = work.child("a.png");
    image.write_binary(b"not really a png")?;
    cargo_run!(
        "colordesc", "-m", model.path(), "-w", work.path(), "quantize", "-K", "sift", "--color-descriptor", "/bin/false",
        image.path()
    )
    .failure()
    .stdout(predicate::str::is_empty())
    .stderr(predicate::str::contains("量化失败"));
    Ok(())
}

#[rstest]
fn train_on_empty_dir(dirs: (assert_fs::TempDir, assert_fs::TempDir)) -> Result<()> {
    let (model, work) = dirs;
    let data = assert_fs::TempDir::new()?;

    cargo_run!("colordesc", "-m", model.path(), "-w", work.path(), "train", "-K", "sift", data.path())
        .failure()
        .stderr(predicate::str::contains("没有可用于生成码本的描述符"));
    model.child("sift.codebook.npy").assert(predicate::path::missing());
    Ok(())
}

#[rstest]
fn extract_empty_dir(dirs: (assert_fs::TempDir, assert_fs::TempDir)) -> Result<()> {
    let (model, work) = dirs;
    let data = assert_fs::TempDir::new()?;
    let out = assert_fs::TempDir::new()?;

    cargo_run!(
        "colordesc", "-m", model.path(), "-w", work.path(), "extract", "-K", "csift", "-o", out.path(), data.path()
    )
    .success();
    out.child("image.csift.info.npy").assert(predicate::path::is_file());
    out.child("image.csift.descriptors.npy").assert(predicate::path::is_file());
    out.child("image.csift.items.json").assert("[]");
    Ok(())
}

#[test]
fn unknown_kind() -> Result<()> {
    cargo_run!("colordesc", "train", "-K", "surf", ".").failure().stderr(predicate::str::contains("surf"));
    Ok(())
}
