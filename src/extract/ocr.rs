//! OCR for image-only PDFs via external tools.
//!
//! Two strategies: rasterize pages with `pdftoppm` and run `tesseract` per
//! page, or one-shot `ocrmypdf` with a sidecar text file; `auto` tries the
//! one-shot first. Every subprocess runs under a deadline and a failed or
//! timed-out OCR yields empty text — the document is persisted either way.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use super::text::truncate_chars;
use crate::config::{OcrConfig, OcrMode};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("external tool not found: {0}")]
    ToolNotFound(String),
    #[error("ocr failed: {0}")]
    Failed(String),
    #[error("ocr timed out after {0:?}")]
    TimedOut(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a command with piped output under a deadline, killing on overrun.
fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output, OcrError> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                OcrError::ToolNotFound(format!("{:?}", cmd.get_program()))
            }
            _ => OcrError::Io(e),
        })?;

    // drain pipes on side threads so a chatty child cannot block on a full pipe
    let mut stdout_pipe = child.stdout.take();
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut s) = stdout_pipe {
            let _ = s.read_to_end(&mut buf);
        }
        buf
    });
    let mut stderr_pipe = child.stderr.take();
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut s) = stderr_pipe {
            let _ = s.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(OcrError::TimedOut(timeout));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

pub struct OcrEngine {
    config: OcrConfig,
}

impl OcrEngine {
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// Whether the OCR gate fires for this document.
    pub fn should_ocr(&self, kind_is_pdf_or_zip: bool, text: &str, quality: f64) -> bool {
        if !self.config.enabled || !kind_is_pdf_or_zip {
            return false;
        }
        text.chars().count() < self.config.min_text || quality < self.config.min_quality
    }

    /// OCR a PDF body; empty string on any failure.
    pub fn ocr(&self, body: &[u8], max_chars: usize) -> String {
        if !self.config.enabled || body.is_empty() || body.len() > self.config.max_bytes {
            return String::new();
        }
        let started = Instant::now();
        let result = match self.config.mode {
            OcrMode::Pages => self.ocr_pages(body, max_chars),
            OcrMode::OcrMyPdf => self.ocr_mypdf(body, max_chars),
            OcrMode::Auto => match self.ocr_mypdf(body, max_chars) {
                Ok(text) if !text.is_empty() => Ok(text),
                _ => self.ocr_pages(body, max_chars),
            },
        };
        match result {
            Ok(text) => {
                info!(
                    chars = text.chars().count(),
                    elapsed_s = started.elapsed().as_secs_f64(),
                    "ocr done"
                );
                text
            }
            Err(e) => {
                debug!(error = %e, "ocr failed");
                String::new()
            }
        }
    }

    /// Light ghostscript recompression for oversized inputs.
    pub fn compress_pdf_light(&self, body: &[u8]) -> Option<Vec<u8>> {
        if !self.config.compress_pdf || body.len() < self.config.compress_pdf_min_bytes {
            return None;
        }
        let dir = tempfile::TempDir::new().ok()?;
        let in_pdf = dir.path().join("in.pdf");
        let out_pdf = dir.path().join("out.pdf");
        std::fs::write(&in_pdf, body).ok()?;
        let mut cmd = Command::new("gs");
        cmd.args([
            "-sDEVICE=pdfwrite",
            "-dCompatibilityLevel=1.4",
            "-dPDFSETTINGS=/printer",
            "-dNOPAUSE",
            "-dBATCH",
            "-dQUIET",
        ])
        .arg(format!("-sOutputFile={}", out_pdf.display()))
        .arg(&in_pdf);
        match run_with_timeout(&mut cmd, Duration::from_secs(self.config.timeout_s)) {
            Ok(out) if out.status.success() => std::fs::read(&out_pdf).ok(),
            _ => None,
        }
    }

    fn ocr_pages(&self, body: &[u8], max_chars: usize) -> Result<String, OcrError> {
        let dir = tempfile::TempDir::new()?;
        let in_pdf = dir.path().join("in.pdf");
        std::fs::write(&in_pdf, body)?;
        let prefix = dir.path().join("page");

        let mut cmd = Command::new("pdftoppm");
        cmd.args(["-png", "-r", &self.config.dpi.to_string()])
            .arg(&in_pdf)
            .arg(&prefix);
        let out = run_with_timeout(&mut cmd, Duration::from_secs(self.config.timeout_s))?;
        if !out.status.success() {
            return Err(OcrError::Failed(
                String::from_utf8_lossy(&out.stderr).to_string(),
            ));
        }

        let mut pages = list_page_images(dir.path())?;
        pages.sort();
        let mut texts: Vec<String> = Vec::new();
        for (i, image) in pages.iter().enumerate() {
            if i >= self.config.max_pages {
                break;
            }
            match self.run_tesseract(image) {
                Ok(text) if !text.is_empty() => texts.push(text),
                Ok(_) => {}
                Err(e) => debug!(page = i + 1, error = %e, "page ocr failed"),
            }
            let total: usize = texts.iter().map(|t| t.chars().count()).sum();
            if total >= max_chars {
                break;
            }
        }
        Ok(truncate_chars(texts.join("\n\n").trim(), max_chars))
    }

    fn ocr_mypdf(&self, body: &[u8], max_chars: usize) -> Result<String, OcrError> {
        let dir = tempfile::TempDir::new()?;
        let in_pdf = dir.path().join("in.pdf");
        let out_pdf = dir.path().join("out.pdf");
        let sidecar = dir.path().join("out.txt");
        std::fs::write(&in_pdf, body)?;

        let mut cmd = Command::new("ocrmypdf");
        cmd.args(["-l", &self.config.lang, "--jobs", &self.config.jobs, "--skip-text"])
            .arg("--sidecar")
            .arg(&sidecar)
            .arg(&in_pdf)
            .arg(&out_pdf);
        let out = run_with_timeout(&mut cmd, Duration::from_secs(self.config.timeout_s))?;
        if !out.status.success() {
            return Err(OcrError::Failed(
                String::from_utf8_lossy(&out.stderr).to_string(),
            ));
        }
        let text = std::fs::read(&sidecar)
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or_default();
        Ok(truncate_chars(text.trim(), max_chars))
    }

    fn run_tesseract(&self, image: &Path) -> Result<String, OcrError> {
        let mut cmd = Command::new("tesseract");
        cmd.arg(image).arg("stdout").args(["-l", &self.config.lang]);
        let out = run_with_timeout(&mut cmd, Duration::from_secs(self.config.page_timeout_s))?;
        if !out.status.success() {
            return Err(OcrError::Failed(
                String::from_utf8_lossy(&out.stderr).to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn list_page_images(dir: &Path) -> Result<Vec<std::path::PathBuf>, OcrError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("page-") && name.ends_with(".png") {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OcrConfig, OcrMode};

    fn engine(enabled: bool) -> OcrEngine {
        OcrEngine::new(OcrConfig {
            enabled,
            min_text: 200,
            min_quality: 0.25,
            max_bytes: 1024,
            timeout_s: 5,
            page_timeout_s: 5,
            lang: "eng".to_string(),
            jobs: "1".to_string(),
            dpi: 72,
            max_pages: 2,
            mode: OcrMode::Pages,
            compress_pdf: false,
            compress_pdf_min_bytes: 1024,
        })
    }

    #[test]
    fn gate_fires_on_short_or_low_quality_text() {
        let e = engine(true);
        assert!(e.should_ocr(true, "short", 0.9));
        let long: String = std::iter::repeat('a').take(300).collect();
        assert!(e.should_ocr(true, &long, 0.1));
        assert!(!e.should_ocr(true, &long, 0.9));
        assert!(!e.should_ocr(false, "short", 0.0));
    }

    #[test]
    fn disabled_engine_never_fires() {
        let e = engine(false);
        assert!(!e.should_ocr(true, "", 0.0));
        assert_eq!(e.ocr(b"%PDF-1.4", 1000), "");
    }

    #[test]
    fn oversized_body_is_skipped() {
        let e = engine(true);
        let big = vec![0u8; 2048];
        assert_eq!(e.ocr(&big, 1000), "");
    }

    #[test]
    fn timeout_kills_runaway_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let res = run_with_timeout(&mut cmd, Duration::from_millis(200));
        assert!(matches!(res, Err(OcrError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn missing_tool_maps_to_tool_not_found() {
        let mut cmd = Command::new("definitely-not-a-real-binary");
        let res = run_with_timeout(&mut cmd, Duration::from_secs(1));
        assert!(matches!(res, Err(OcrError::ToolNotFound(_))));
    }
}
