use sce_codec::testkit;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn scecodec_command(data_path: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_scecodec"));
    command.arg("--data-path").arg(data_path).env_remove("PS3");
    command
}

fn run(data_path: &Path, args: &[&str]) -> Result<Output, Box<dyn Error>> {
    Ok(scecodec_command(data_path).args(args).output()?)
}

#[test]
fn cli_end_to_end_flow() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    testkit::write_data_dir(dir.path())?;
    let elf = dir.path().join("app.elf");
    let container = dir.path().join("app.self");
    let restored = dir.path().join("restored.elf");
    fs::write(&elf, testkit::sample_elf())?;

    let encrypt = run(
        dir.path(),
        &[
            "encrypt",
            "--compress-data",
            "TRUE",
            "--self-auth-id",
            "1010000001000003",
            elf.to_str().unwrap(),
            container.to_str().unwrap(),
        ],
    )?;
    assert!(
        encrypt.status.success(),
        "encrypt command failed: {}",
        String::from_utf8_lossy(&encrypt.stderr)
    );
    assert!(String::from_utf8(encrypt.stdout)?.contains("Encrypted"));
    assert!(container.exists(), "container should exist after encrypt");

    let info = run(dir.path(), &["print-infos", container.to_str().unwrap()])?;
    assert!(info.status.success());
    let info_stdout = String::from_utf8(info.stdout)?;
    assert!(info_stdout.contains("Type: SELF"));
    assert!(info_stdout.contains("Auth ID: 0x1010000001000003"));
    assert!(info_stdout.contains("Status: OK"));

    let decrypt = run(
        dir.path(),
        &["decrypt", container.to_str().unwrap(), restored.to_str().unwrap()],
    )?;
    assert!(
        decrypt.status.success(),
        "decrypt command failed: {}",
        String::from_utf8_lossy(&decrypt.stderr)
    );
    assert_eq!(fs::read(&restored)?, testkit::sample_elf());

    Ok(())
}

#[test]
fn cli_npdrm_requires_klicensee() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    testkit::write_data_dir(dir.path())?;
    let elf = dir.path().join("app.elf");
    let container = dir.path().join("EBOOT.BIN");
    let restored = dir.path().join("restored.elf");
    fs::write(&elf, testkit::sample_elf())?;
    let klicensee = hex::encode(testkit::TEST_KLICENSEE);

    let encrypt = run(
        dir.path(),
        &[
            "encrypt",
            "--self-type",
            "NPDRM",
            "--np-license-type",
            "LOCAL",
            "--np-content-id",
            testkit::TEST_CONTENT_ID,
            "--np-klicensee",
            &klicensee,
            elf.to_str().unwrap(),
            container.to_str().unwrap(),
        ],
    )?;
    assert!(
        encrypt.status.success(),
        "encrypt command failed: {}",
        String::from_utf8_lossy(&encrypt.stderr)
    );

    let without = run(
        dir.path(),
        &["decrypt", container.to_str().unwrap(), restored.to_str().unwrap()],
    )?;
    assert!(!without.status.success());
    assert!(String::from_utf8(without.stderr)?.contains("Error:"));

    let with = run(
        dir.path(),
        &[
            "decrypt",
            "--np-klicensee",
            &klicensee,
            container.to_str().unwrap(),
            restored.to_str().unwrap(),
        ],
    )?;
    assert!(with.status.success());
    assert_eq!(fs::read(&restored)?, testkit::sample_elf());

    Ok(())
}

#[test]
fn cli_print_keys() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    testkit::write_data_dir(dir.path())?;

    let output = run(dir.path(), &["print-keys"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("Keyset (13 records)"));
    assert!(stdout.contains("app-rev1"));

    Ok(())
}

#[test]
fn cli_reports_errors() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let missing = dir.path().join("missing.self");
    let output = run(
        dir.path(),
        &["decrypt", missing.to_str().unwrap(), "out.elf"],
    )?;
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8(output.stderr)?.contains("Error:"));

    let version = run(dir.path(), &["-V"])?;
    assert!(String::from_utf8(version.stdout)?.starts_with("scecodec "));

    Ok(())
}
