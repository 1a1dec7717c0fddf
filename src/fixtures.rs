//! Synthetic PKI for unit tests

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
};

/// A self-signed CA able to issue leaf certificates
pub(crate) struct TestCa {
    cert: Certificate,
    pub pem: String,
}

/// A freshly issued leaf certificate
pub(crate) struct IssuedCert {
    pub chain_pem: String,
    pub key_pem: String,
    pub leaf_der: Vec<u8>,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::new(vec![]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = Certificate::from_params(params).unwrap();
        let pem = cert.serialize_pem().unwrap();
        TestCa { cert, pem }
    }

    pub fn issue_server(&self, dns_name: &str) -> IssuedCert {
        let mut params = CertificateParams::new(vec![dns_name.to_string()]);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, dns_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = Certificate::from_params(params).unwrap();
        let leaf_pem = cert.serialize_pem_with_signer(&self.cert).unwrap();
        let leaf_der = rustls_pemfile::certs(&mut leaf_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap()
            .as_ref()
            .to_vec();

        IssuedCert {
            chain_pem: format!("{}{}", leaf_pem, self.pem),
            key_pem: cert.serialize_private_key_pem(),
            leaf_der,
        }
    }

    pub fn issue_client(&self, common_name: Option<&str>) -> IssuedCert {
        let mut subject = DistinguishedName::new();
        if let Some(cn) = common_name {
            subject.push(DnType::CommonName, cn);
        }
        subject.push(DnType::OrganizationName, "Acme Co");
        self.issue_client_with_subject(subject)
    }

    pub fn issue_client_with_subject(&self, subject: DistinguishedName) -> IssuedCert {
        let mut params = CertificateParams::new(vec![]);
        params.distinguished_name = subject;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let cert = Certificate::from_params(params).unwrap();
        let leaf_pem = cert.serialize_pem_with_signer(&self.cert).unwrap();
        let leaf_der = rustls_pemfile::certs(&mut leaf_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap()
            .as_ref()
            .to_vec();

        IssuedCert {
            chain_pem: leaf_pem,
            key_pem: cert.serialize_private_key_pem(),
            leaf_der,
        }
    }
}

/// Render a secret payload the way the secret store holds it
pub(crate) fn payload(server: &IssuedCert) -> String {
    serde_json::json!({
        "private_key": server.key_pem,
        "fullchain": server.chain_pem,
    })
    .to_string()
}
