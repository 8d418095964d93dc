//! Agent key, CSR, and certificate files.
//!
//! The private key is generated once per installation and reused for every
//! later registration unless regeneration is forced. Regenerating the key
//! removes the certificate issued for the old one, so the key and
//! certificate on disk always belong together.

use std::fs;
use std::io::{ErrorKind, Write};
use std::net::IpAddr;
use std::path::Path;

use rcgen::string::Ia5String;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PublicKeyData, SanType};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::config::AgentPaths;
use crate::error::{AgentError, Result};

/// A certificate signing request and the fingerprint of its key.
#[derive(Debug, Clone)]
pub struct CsrBundle {
    /// PEM-encoded CSR.
    pub csr_pem: String,
    /// Uppercase hex SHA-256 of the public key.
    pub fingerprint: String,
}

/// Make sure an agent key exists and build a CSR for `host` from it.
///
/// A new key is generated when none exists or when `regenerate` is set.
/// The CSR carries `host` as an IP address SAN if it parses as one, and as
/// a DNS name SAN otherwise.
///
/// # Errors
///
/// Returns an error if the key file cannot be read or written, if the
/// existing key is malformed, or if `host` is not a valid DNS name.
pub fn ensure_identity(paths: &AgentPaths, host: &str, regenerate: bool) -> Result<CsrBundle> {
    let existing = if regenerate {
        None
    } else {
        read_optional(&paths.key_pem)?
    };

    let key_pair = if let Some(pem) = existing {
        let key_pair = KeyPair::from_pem(&pem).map_err(|e| {
            AgentError::Key(format!(
                "cannot parse key {}: {e}",
                paths.key_pem.display()
            ))
        })?;
        tracing::info!(path = %paths.key_pem.display(), "Loaded existing agent key");
        key_pair
    } else {
        let key_pair = KeyPair::generate()
            .map_err(|e| AgentError::Key(format!("failed to generate agent key: {e}")))?;
        write_restricted(&paths.key_pem, key_pair.serialize_pem().as_bytes())?;
        remove_optional(&paths.cert_pem)?;
        tracing::info!(path = %paths.key_pem.display(), "Generated agent key");
        key_pair
    };

    let csr_pem = build_csr(&key_pair, host)?;
    Ok(CsrBundle {
        csr_pem,
        fingerprint: fingerprint(&key_pair),
    })
}

/// Uppercase hex SHA-256 of the key's public key info.
#[must_use]
pub fn fingerprint(key_pair: &KeyPair) -> String {
    hex::encode_upper(Sha256::digest(key_pair.subject_public_key_info()))
}

fn build_csr(key_pair: &KeyPair, host: &str) -> Result<String> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "fleet-agent");
    params.distinguished_name = dn;

    let san = match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(Ia5String::try_from(host).map_err(|e| {
            AgentError::Certificate(format!("invalid agent host name {host}: {e}"))
        })?),
    };
    params.subject_alt_names = vec![san];

    params
        .serialize_request(key_pair)
        .and_then(|csr| csr.pem())
        .map_err(|e| AgentError::Certificate(format!("failed to create CSR: {e}")))
}

/// Files of a complete TLS identity.
#[derive(Clone)]
pub struct TlsIdentity {
    /// Agent private key (PEM).
    pub key_pem: String,
    /// Agent certificate (PEM).
    pub cert_pem: String,
    /// Controller root CA (PEM).
    pub ca_pem: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Certificate followed by key, as one PEM bundle.
    #[must_use]
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut bundle = self.cert_pem.clone().into_bytes();
        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(self.key_pem.as_bytes());
        bundle
    }
}

/// Load the TLS identity.
///
/// Returns `None` when none of the files exist.
///
/// # Errors
///
/// Returns `AgentError::Tls` when only some of the files exist, when one
/// does not parse, or when the certificate does not belong to the key.
pub fn load_identity(paths: &AgentPaths) -> Result<Option<TlsIdentity>> {
    let key_pem = read_optional(&paths.key_pem)?;
    let cert_pem = read_optional(&paths.cert_pem)?;
    let ca_pem = read_optional(&paths.root_ca_pem)?;

    let (key_pem, cert_pem, ca_pem) = match (key_pem, cert_pem, ca_pem) {
        (None, None, None) => return Ok(None),
        (Some(key), Some(cert), Some(ca)) => (key, cert, ca),
        (key, cert, ca) => {
            let missing: Vec<String> = [
                (key.is_none(), &paths.key_pem),
                (cert.is_none(), &paths.cert_pem),
                (ca.is_none(), &paths.root_ca_pem),
            ]
            .iter()
            .filter(|(absent, _)| *absent)
            .map(|(_, path)| path.display().to_string())
            .collect();
            return Err(AgentError::Tls(format!(
                "incomplete TLS files, missing {}",
                missing.join(", ")
            )));
        }
    };

    let key_pair =
        KeyPair::from_pem(&key_pem).map_err(|e| AgentError::Tls(format!("invalid key: {e}")))?;
    parse_certificate(&ca_pem, |_| Ok(()))
        .map_err(|e| AgentError::Tls(format!("invalid root CA: {e}")))?;
    verify_pair(&cert_pem, &key_pair).map_err(|e| AgentError::Tls(e.to_string()))?;

    Ok(Some(TlsIdentity {
        key_pem,
        cert_pem,
        ca_pem,
    }))
}

/// Check that `cert_pem` parses and certifies the public key of `key_pair`.
///
/// # Errors
///
/// Returns `AgentError::Certificate` if it does not.
pub fn verify_pair(cert_pem: &str, key_pair: &KeyPair) -> Result<()> {
    let expected = key_pair.subject_public_key_info();
    parse_certificate(cert_pem, |cert| {
        if cert.public_key().raw == expected.as_slice() {
            Ok(())
        } else {
            Err(AgentError::Certificate(
                "certificate does not match the agent key".to_string(),
            ))
        }
    })
}

/// Parse a PEM certificate and run `check` on it.
///
/// # Errors
///
/// Returns `AgentError::Certificate` if the PEM or DER is malformed, or
/// whatever `check` returns.
pub fn parse_certificate<F>(cert_pem: &str, check: F) -> Result<()>
where
    F: FnOnce(&X509Certificate<'_>) -> Result<()>,
{
    let pem = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| AgentError::Certificate(format!("failed to parse PEM: {e}")))?;
    let (_, cert) = X509Certificate::from_der(pem.contents())
        .map_err(|e| AgentError::Certificate(format!("failed to parse certificate: {e}")))?;
    check(&cert)
}

/// Load the agent key.
///
/// # Errors
///
/// Returns an error if the key file is missing, unreadable, or malformed.
pub fn load_key(paths: &AgentPaths) -> Result<KeyPair> {
    let pem = fs::read_to_string(&paths.key_pem).map_err(|e| AgentError::io(&paths.key_pem, e))?;
    KeyPair::from_pem(&pem).map_err(|e| AgentError::Key(e.to_string()))
}

/// Write `contents` to `path`, readable by the owner only.
///
/// Any existing file is replaced rather than truncated, so a file created
/// earlier with wider permissions does not keep them.
///
/// # Errors
///
/// Returns `AgentError::Io` naming the file on failure.
pub fn write_restricted(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AgentError::io(parent, e))?;
    }
    remove_optional(path)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| AgentError::io(path, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| AgentError::io(path, e))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AgentError::io(path, e)),
    }
}

fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(AgentError::io(path, e)),
        _ => Ok(()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestCa;
    use super::*;
    use tempfile::TempDir;

    fn san_of(csr_pem: &str) -> Vec<String> {
        let pem = ::pem::parse(csr_pem.as_bytes()).unwrap();
        let (_, csr) =
            x509_parser::certification_request::X509CertificationRequest::from_der(pem.contents())
                .unwrap();
        let mut names = Vec::new();
        for ext in csr.requested_extensions().into_iter().flatten() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    names.push(format!("{name:?}"));
                }
            }
        }
        names
    }

    #[test]
    fn generates_key_once_and_reuses_it() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());

        let first = ensure_identity(&paths, "192.0.2.1", false).unwrap();
        let key_before = fs::read(&paths.key_pem).unwrap();
        let second = ensure_identity(&paths, "192.0.2.1", false).unwrap();

        assert_eq!(fs::read(&paths.key_pem).unwrap(), key_before);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.fingerprint.len(), 64);
        assert!(first
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn regenerate_replaces_key_and_drops_certificate() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        let first = ensure_identity(&paths, "agent.example.org", false).unwrap();
        fs::write(&paths.cert_pem, "stale").unwrap();

        let second = ensure_identity(&paths, "agent.example.org", true).unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
        assert!(!paths.cert_pem.exists());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        ensure_identity(&paths, "192.0.2.1", false).unwrap();

        let mode = fs::metadata(&paths.key_pem).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_key_is_fatal() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        fs::write(&paths.key_pem, "not a key").unwrap();

        let err = ensure_identity(&paths, "192.0.2.1", false).unwrap_err();
        assert!(matches!(err, AgentError::Key(_)));
    }

    #[test]
    fn san_is_ip_or_dns_never_both() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());

        let by_ip = san_of(&ensure_identity(&paths, "192.0.2.1", false).unwrap().csr_pem);
        assert_eq!(by_ip.len(), 1);
        assert!(by_ip[0].starts_with("IPAddress"));

        let by_name = san_of(
            &ensure_identity(&paths, "agent.example.org", false)
                .unwrap()
                .csr_pem,
        );
        assert_eq!(by_name.len(), 1);
        assert!(by_name[0].contains("agent.example.org"));
    }

    #[test]
    fn load_identity_checks_completeness_and_pairing() {
        let dir = TempDir::new().unwrap();
        let paths = AgentPaths::under(dir.path());
        assert!(load_identity(&paths).unwrap().is_none());

        let bundle = ensure_identity(&paths, "192.0.2.1", false).unwrap();
        let err = load_identity(&paths).unwrap_err();
        assert!(matches!(err, AgentError::Tls(ref m) if m.contains("incomplete")));

        let ca = TestCa::new();
        fs::write(&paths.cert_pem, ca.sign(&bundle.csr_pem)).unwrap();
        fs::write(&paths.root_ca_pem, &ca.cert_pem).unwrap();
        let identity = load_identity(&paths).unwrap().unwrap();
        assert!(String::from_utf8(identity.identity_pem())
            .unwrap()
            .contains("PRIVATE KEY"));

        // A certificate for another key is rejected
        let other = TempDir::new().unwrap();
        let other_paths = AgentPaths::under(other.path());
        let other_csr = ensure_identity(&other_paths, "192.0.2.2", false).unwrap();
        fs::write(&paths.cert_pem, ca.sign(&other_csr.csr_pem)).unwrap();
        assert!(matches!(load_identity(&paths), Err(AgentError::Tls(_))));
    }
}
