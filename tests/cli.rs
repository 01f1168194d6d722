//! The `pdf-watermark` binary: progress lines, the trailing timing record and
//! exit codes.

mod common;

use common::{write_pdf, write_watermark};
use std::path::Path;
use std::process::{Command, Output};

const PROGRESS: &str = "Watermarked page ";

fn run_cli(input: &Path, output: &Path, watermark: &Path, extra: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pdf-watermark"))
        .arg(input)
        .arg(output)
        .arg(watermark)
        .args(["--workers", "2"])
        .args(extra)
        .env("RUST_LOG", "info")
        .output()
        .unwrap()
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

/// `(x, total)` of every progress line, in output order.
fn progress(lines: &[String]) -> Vec<(usize, usize)> {
    lines
        .iter()
        .filter_map(|line| {
            let (_, tail) = line.split_once(PROGRESS)?;
            let (x, total) = tail.trim().split_once('/')?;
            Some((x.parse().ok()?, total.parse().ok()?))
        })
        .collect()
}

#[test]
fn clean_run_reports_progress_then_timing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    let watermark = dir.path().join("logo.png");
    write_pdf(&input, 7, &[]);
    write_watermark(&watermark);

    let result = run_cli(&input, &output, &watermark, &[]);
    let lines = stdout_lines(&result);

    assert_eq!(result.status.code(), Some(0), "{:?}", lines);
    assert!(output.exists());

    let expected: Vec<(usize, usize)> = (1..=7).map(|x| (x, 7)).collect();
    assert_eq!(progress(&lines), expected);
    assert!(lines.iter().any(|l| l.contains("INFO")));

    let last = lines.last().unwrap();
    let timing: serde_json::Value = serde_json::from_str(last).unwrap();
    for key in [
        "watermark_preparation",
        "watermarking",
        "watermarking_and_saving",
        "total_time",
    ] {
        assert!(timing[key].is_f64(), "missing {} in {}", key, last);
    }
}

#[test]
fn page_failure_exits_two_and_still_saves() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    let watermark = dir.path().join("logo.png");
    write_pdf(&input, 4, &[1]);
    write_watermark(&watermark);

    let result = run_cli(&input, &output, &watermark, &[]);
    let lines = stdout_lines(&result);

    assert_eq!(result.status.code(), Some(2), "{:?}", lines);
    assert!(output.exists());
    assert_eq!(progress(&lines).len(), 4);
    assert!(lines.iter().any(|l| l.contains("ERROR")));
    let last = lines.last().unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(last).is_ok());
}

#[test]
fn invalid_opacity_exits_one_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    let output = dir.path().join("out.pdf");
    let watermark = dir.path().join("logo.png");
    write_pdf(&input, 2, &[]);
    write_watermark(&watermark);

    let result = run_cli(&input, &output, &watermark, &["--opacity", "1.5"]);
    let lines = stdout_lines(&result);

    assert_eq!(result.status.code(), Some(1), "{:?}", lines);
    assert!(!output.exists());
    assert!(progress(&lines).is_empty());
    assert!(lines
        .iter()
        .all(|l| serde_json::from_str::<serde_json::Value>(l).is_err()));
}

#[test]
fn missing_input_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.pdf");
    let watermark = dir.path().join("logo.png");
    write_watermark(&watermark);

    let result = run_cli(&dir.path().join("missing.pdf"), &output, &watermark, &[]);
    assert_eq!(result.status.code(), Some(1));
    assert!(!output.exists());
}
