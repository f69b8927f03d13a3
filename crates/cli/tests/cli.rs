// nrfemu - Cortex-M instruction-level emulator
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Binary-level tests for the front end.

use assert_cmd::Command;
use std::io::Write;

/// Firmware that computes 7 + 5 and branches to the exit sentinel.
fn exit_firmware() -> Vec<u8> {
    let halfwords: &[u16] = &[
        0x2007, // movs r0, #7
        0x2105, // movs r1, #5
        0x1840, // adds r0, r0, r1
        0x4a01, // ldr r2, [pc, #4]
        0x4710, // bx r2
        0xbf00, //
        0xbeef, 0xdead,
    ];
    let mut image = Vec::new();
    image.extend_from_slice(&0x2000_8000u32.to_le_bytes());
    image.extend_from_slice(&0x0000_0009u32.to_le_bytes());
    for h in halfwords {
        image.extend_from_slice(&h.to_le_bytes());
    }
    image
}

fn write_firmware(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn requires_a_firmware_argument() {
    Command::cargo_bin("nrfemu").unwrap().assert().failure();
}

#[test]
fn runs_firmware_to_completion() {
    let firmware = write_firmware(&exit_firmware());
    Command::cargo_bin("nrfemu")
        .unwrap()
        .arg(firmware.path())
        .assert()
        .success()
        .stderr(predicates::str::contains("exited."));
}

#[test]
fn rejects_a_non_power_of_two_pagesize() {
    let firmware = write_firmware(&exit_firmware());
    Command::cargo_bin("nrfemu")
        .unwrap()
        .arg(firmware.path())
        .arg("--pagesize=300")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn rejects_firmware_larger_than_flash() {
    let firmware = write_firmware(&vec![0u8; 8 * 1024]);
    Command::cargo_bin("nrfemu")
        .unwrap()
        .arg(firmware.path())
        .arg("--flash=4")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn undefined_instruction_is_a_runtime_fault() {
    // 0x41d1 is the unimplemented ROR encoding.
    let mut image = Vec::new();
    image.extend_from_slice(&0x2000_8000u32.to_le_bytes());
    image.extend_from_slice(&0x0000_0009u32.to_le_bytes());
    image.extend_from_slice(&0x41d1u16.to_le_bytes());
    let firmware = write_firmware(&image);
    Command::cargo_bin("nrfemu")
        .unwrap()
        .arg(firmware.path())
        .assert()
        .failure()
        .code(1);
}
