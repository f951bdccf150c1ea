//! Throwaway TLS material: a one-off CA plus a leaf signed by it, written
//! as PEM files into a temp directory.

use std::fs;
use std::path::PathBuf;

use md5::Md5;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use sha1::{Digest, Sha1};
use tempfile::TempDir;

/// Paths and fingerprints of one generated chain.  Files live until the
/// struct drops.
pub struct TestTls {
    pub dir: TempDir,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Colon-separated uppercase hex of the leaf DER, as the fingerprint
    /// allow-list expects them.
    pub sha1_fingerprint: String,
    pub md5_fingerprint: String,
}

impl TestTls {
    /// Generate a chain whose leaf has `cn` as common name and
    /// `cn` + `127.0.0.1` as subject alternative names.
    pub fn generate(cn: &str) -> TestTls {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut ca_params =
            CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "backhaul test ca");
        let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

        let leaf_key = KeyPair::generate().expect("generate leaf key");
        let mut leaf_params =
            CertificateParams::new(vec![cn.to_owned(), "127.0.0.1".to_owned()])
                .expect("leaf params");
        leaf_params.distinguished_name.push(DnType::CommonName, cn);
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("sign leaf");

        let der = leaf_cert.der();
        let sha1_fingerprint = colon_hex(&Sha1::digest(der));
        let md5_fingerprint = colon_hex(&Md5::digest(der));

        let dir = tempfile::tempdir().expect("tls tempdir");
        let ca_file = dir.path().join("ca.pem");
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        fs::write(&ca_file, ca_cert.pem()).expect("write CA pem");
        fs::write(&cert_file, leaf_cert.pem()).expect("write cert pem");
        fs::write(&key_file, leaf_key.serialize_pem()).expect("write key pem");

        TestTls { dir, ca_file, cert_file, key_file, sha1_fingerprint, md5_fingerprint }
    }

    /// Write a fingerprint allow-list file containing the given lines.
    pub fn write_fingerprint_file(&self, lines: &[String]) -> PathBuf {
        let path = self.dir.path().join("fingerprints");
        fs::write(&path, lines.join("\n") + "\n").expect("write fingerprint file");
        path
    }

    /// An allow-list line matching this leaf by SHA-1.
    pub fn sha1_line(&self) -> String {
        format!("SHA1 Fingerprint={}", self.sha1_fingerprint)
    }

    /// An allow-list line that matches nothing (last byte flipped).
    pub fn mismatching_sha1_line(&self) -> String {
        let mut print = self.sha1_fingerprint.clone();
        let flipped = if print.ends_with('0') { '1' } else { '0' };
        print.pop();
        print.push(flipped);
        format!("SHA1 Fingerprint={print}")
    }
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
