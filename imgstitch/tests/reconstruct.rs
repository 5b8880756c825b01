// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Full-pipeline tests: run the actual binary against a temporary image and
//! extracted tree, then execute the generated script with `sh` and check that
//! it reproduces the image byte for byte.

#![cfg(unix)]

use std::{
    fs,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::{Command, Stdio},
};

use tempfile::TempDir;

/// Deterministic junk with no repeated or all-zero blocks.
fn test_bytes(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);

    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect()
}

fn generate(image: &Path, tree: &Path, script: &Path, file_list: &[&str], extra_args: &[&str]) {
    let list = file_list.join("\n");

    let mut child = Command::new(env!("CARGO_BIN_EXE_imgstitch"))
        .arg(image)
        .arg("-o")
        .arg(script)
        .args(["-b", "256", "-m", "1024"])
        .args(extra_args)
        .current_dir(tree)
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(list.as_bytes())
        .unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "generator failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
}

fn run_script(script: &Path, args: &[&str]) -> std::process::Output {
    Command::new("sh")
        .arg(script)
        .args(args)
        .output()
        .unwrap()
}

struct Fixture {
    temp_dir: TempDir,
    image_data: Vec<u8>,
}

impl Fixture {
    /// Image layout: [0, 1024) only in the image, [1024, 4096) in f1,
    /// [4096, 8292) in sub/f3 (with a ragged 100-byte tail). f2 matches
    /// nothing.
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let image_data = test_bytes(8292, 42);

        fs::write(root.join("image.img"), &image_data).unwrap();

        let tree = root.join("tree");
        fs::create_dir(&tree).unwrap();
        fs::create_dir(tree.join("sub")).unwrap();

        fs::write(tree.join("f1"), &image_data[1024..4096]).unwrap();
        let filler = image_data[..2048].iter().map(|b| !b).collect::<Vec<_>>();
        fs::write(tree.join("f2"), filler).unwrap();
        fs::write(tree.join("sub/f3"), &image_data[4096..8292]).unwrap();

        Self {
            temp_dir,
            image_data,
        }
    }

    fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    fn image(&self) -> std::path::PathBuf {
        self.root().join("image.img")
    }

    fn tree(&self) -> std::path::PathBuf {
        self.root().join("tree")
    }

    fn script(&self) -> std::path::PathBuf {
        self.root().join("rebuild.sh")
    }
}

#[test]
fn script_rebuilds_image_byte_for_byte() {
    let fixture = Fixture::new();

    generate(
        &fixture.image(),
        &fixture.tree(),
        &fixture.script(),
        &["f1", "f2", "sub/f3"],
        &[],
    );

    // The generator marks its output executable.
    let mode = fs::metadata(fixture.script()).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);

    let out = fixture.root().join("out.img");
    let tree = fixture.tree();
    let output = run_script(
        &fixture.script(),
        &["-T", tree.to_str().unwrap(), "-o", out.to_str().unwrap()],
    );

    assert!(
        output.status.success(),
        "script failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
    assert_eq!(fs::read(out).unwrap(), fixture.image_data);
}

#[test]
fn script_restores_permissions() {
    let fixture = Fixture::new();
    let f1 = fixture.tree().join("f1");

    fs::set_permissions(&f1, fs::Permissions::from_mode(0o601)).unwrap();

    generate(
        &fixture.image(),
        &fixture.tree(),
        &fixture.script(),
        &["f1"],
        &["--no-acl"],
    );

    // Change the mode after generation; the script should put it back.
    fs::set_permissions(&f1, fs::Permissions::from_mode(0o644)).unwrap();

    let out = fixture.root().join("out.img");
    let tree = fixture.tree();
    let output = run_script(
        &fixture.script(),
        &["-T", tree.to_str().unwrap(), "-o", out.to_str().unwrap()],
    );

    assert!(
        output.status.success(),
        "script failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );

    let mode = fs::metadata(&f1).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o601);
}

#[test]
fn check_only_mode_detects_modified_file() {
    let fixture = Fixture::new();

    generate(
        &fixture.image(),
        &fixture.tree(),
        &fixture.script(),
        &["f1", "f2", "sub/f3"],
        &[],
    );

    let tree = fixture.tree();
    let output = run_script(&fixture.script(), &["-i", "-T", tree.to_str().unwrap()]);
    assert!(output.status.success());

    // Truncate a file: the size check fails even without checksum tools.
    let f2 = tree.join("f2");
    let mut data = fs::read(&f2).unwrap();
    data.truncate(data.len() - 1);
    fs::write(&f2, data).unwrap();

    let output = run_script(&fixture.script(), &["-i", "-T", tree.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn tiny_image_is_fully_embedded() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let image_data = test_bytes(512, 7);

    fs::write(root.join("image.img"), &image_data).unwrap();

    let tree = root.join("tree");
    fs::create_dir(&tree).unwrap();
    fs::write(tree.join("f1"), &image_data).unwrap();

    let script = root.join("rebuild.sh");

    // The image is smaller than the minimum extent size, so even an identical
    // file can't be referenced.
    generate(&root.join("image.img"), &tree, &script, &["f1"], &[]);

    let out = root.join("out.img");
    let output = run_script(
        &script,
        &["-T", tree.to_str().unwrap(), "-o", out.to_str().unwrap()],
    );

    assert!(
        output.status.success(),
        "script failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
    assert_eq!(fs::read(out).unwrap(), image_data);
}

#[test]
fn refuses_missing_extracted_file() {
    let fixture = Fixture::new();

    generate(
        &fixture.image(),
        &fixture.tree(),
        &fixture.script(),
        &["f1"],
        &[],
    );

    fs::remove_file(fixture.tree().join("f1")).unwrap();

    let out = fixture.root().join("out.img");
    let tree = fixture.tree();
    let output = run_script(
        &fixture.script(),
        &["-T", tree.to_str().unwrap(), "-o", out.to_str().unwrap()],
    );

    assert!(!output.status.success());
    assert!(!out.exists());
}

#[test]
fn null_separated_file_list() {
    let fixture = Fixture::new();
    let script = fixture.script();

    let mut child = Command::new(env!("CARGO_BIN_EXE_imgstitch"))
        .arg(fixture.image())
        .arg("-o")
        .arg(&script)
        .args(["-b", "256", "-m", "1024", "-0"])
        .current_dir(fixture.tree())
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"f1\0sub/f3\0")
        .unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "generator failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );

    let out = fixture.root().join("out.img");
    let tree = fixture.tree();
    let output = run_script(
        &script,
        &["-T", tree.to_str().unwrap(), "-o", out.to_str().unwrap()],
    );

    assert!(output.status.success());
    assert_eq!(fs::read(out).unwrap(), fixture.image_data);
}
