// src/driver/save.rs
//! PEM export for discovered certificates.

use anyhow::{Context, Result};
use base64::Engine;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write a certificate chain to a PEM file, one CERTIFICATE block per
/// certificate. Existing files are left untouched.
pub fn certs_to_pem_file<C: AsRef<[u8]>>(certs: &[C], path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create PEM file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for cert in certs {
        write_pem_block(&mut writer, cert.as_ref())?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a single raw DER certificate to a PEM file. Existing files are left
/// untouched.
pub fn raw_cert_to_pem_file(der: &[u8], path: &Path) -> Result<()> {
    certs_to_pem_file(&[der], path)
}

fn write_pem_block<W: Write>(writer: &mut W, der: &[u8]) -> Result<()> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    writeln!(writer, "-----BEGIN CERTIFICATE-----")?;
    for chunk in encoded.as_bytes().chunks(64) {
        writer.write_all(chunk)?;
        writeln!(writer)?;
    }
    writeln!(writer, "-----END CERTIFICATE-----")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_writes_pem_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");

        certs_to_pem_file(&[b"first cert".as_slice(), b"second cert"], &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("-----BEGIN CERTIFICATE-----").count(), 2);
        assert_eq!(content.matches("-----END CERTIFICATE-----").count(), 2);
        assert!(content.contains(&base64::engine::general_purpose::STANDARD.encode(b"first cert")));
    }

    #[test]
    fn test_body_wraps_at_64_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");

        raw_cert_to_pem_file(&[0xAB; 200], &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            assert!(line.len() <= 64);
        }
    }

    #[test]
    fn test_existing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        fs::write(&path, "already here").unwrap();

        raw_cert_to_pem_file(b"new cert", &path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "already here");
    }
}
