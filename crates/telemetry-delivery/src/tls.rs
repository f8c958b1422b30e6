// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::TransportError;
use reqwest::ClientBuilder;
#[cfg(feature = "fips")]
use tracing::debug;

/// Creates a reqwest client builder using rustls.
///
/// `verify` turns certificate and hostname validation on or off.
#[cfg(not(feature = "fips"))]
pub fn client_builder(verify: bool) -> Result<ClientBuilder, TransportError> {
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(!verify))
}

/// Creates a reqwest client builder with a FIPS-compliant rustls configuration.
///
/// Native root certificates are loaded and the process-wide crypto provider must already be a
/// FIPS provider. Verification cannot be disabled in this mode.
#[cfg(feature = "fips")]
pub fn client_builder(verify: bool) -> Result<ClientBuilder, TransportError> {
    if !verify {
        return Err(TransportError::Build(
            "TLS verification cannot be disabled in FIPS mode".to_string(),
        ));
    }

    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| TransportError::Build("No crypto provider configured".to_string()))?;
    if !provider.fips() {
        return Err(TransportError::Build(
            "Crypto provider is not FIPS-compliant".to_string(),
        ));
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let mut valid_count = 0;
    for cert in rustls_native_certs::load_native_certs().certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => debug!("Failed to parse certificate: {:?}", err),
        }
    }
    if valid_count == 0 {
        return Err(TransportError::Build(
            "No valid certificates found in native root store".to_string(),
        ));
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| TransportError::Build(format!("Failed to set protocol versions: {e}")))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    if !config.fips() {
        return Err(TransportError::Build(
            "The final TLS configuration is not FIPS-compliant".to_string(),
        ));
    }
    debug!("Client builder is configured with FIPS.");

    Ok(reqwest::Client::builder().use_preconfigured_tls(config))
}
