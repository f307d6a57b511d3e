//! HTTP transport adapter.
//!
//! [`HttpTransport`] over `embedded_svc::http::client::Client` wrapping an
//! `EspHttpConnection`.  One connection per request, TLS verified against
//! the ESP-IDF certificate bundle.  Only the headers the runtime consumes
//! are collected from responses.
//!
//! On the host there is no network: the transport reports disconnected
//! and every request fails with [`TransportError::NotConnected`].

use crate::app::ports::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Response headers copied into [`HttpResponse`].
pub const COLLECTED_HEADERS: [&str; 4] =
    ["ETag", "Last-Modified", "Content-Type", "Content-Length"];

/// Largest body read into memory.  Firmware images stream through
/// [`crate::adapters::firmware`] instead.
pub const MAX_BODY_LEN: usize = 16 * 1024;

#[derive(Debug, Default)]
pub struct EspHttpTransport;

impl EspHttpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "espidf")]
mod platform {
    use super::{COLLECTED_HEADERS, MAX_BODY_LEN};
    use crate::app::ports::{HttpRequest, HttpResponse, Method, TransportError};

    use embedded_svc::http::Method as SvcMethod;
    use embedded_svc::http::{Headers, Status};
    use embedded_svc::http::client::Client;
    use embedded_svc::io::{Read, Write};
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
    use log::warn;

    pub(crate) fn svc_method(method: Method) -> SvcMethod {
        match method {
            Method::Get => SvcMethod::Get,
            Method::Head => SvcMethod::Head,
            Method::Post => SvcMethod::Post,
        }
    }

    /// Open a client configured for `request`.
    pub(crate) fn client(
        request: &HttpRequest,
    ) -> Result<Client<EspHttpConnection>, TransportError> {
        let conf = Configuration {
            timeout: Some(request.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let conn = EspHttpConnection::new(&conf).map_err(|e| {
            warn!("HTTP: connection setup failed: {:?}", e);
            TransportError::ConnectFailed
        })?;
        Ok(Client::wrap(conn))
    }

    pub(crate) fn send(request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut client = client(request)?;

        let content_length = request.body.len().to_string();
        let mut headers: Vec<(&str, &str)> =
            request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if !request.body.is_empty() {
            headers.push(("Content-Length", &content_length));
        }

        let mut req = client
            .request(svc_method(request.method), &request.url, &headers)
            .map_err(|e| {
                warn!("HTTP: request to {} failed: {:?}", request.url, e);
                TransportError::ConnectFailed
            })?;
        if !request.body.is_empty() {
            req.write_all(&request.body).map_err(|_| TransportError::Io)?;
            req.flush().map_err(|_| TransportError::Io)?;
        }
        let mut response = req.submit().map_err(|e| {
            warn!("HTTP: submit to {} failed: {:?}", request.url, e);
            TransportError::Timeout
        })?;

        let status = response.status();
        let headers = COLLECTED_HEADERS
            .iter()
            .filter_map(|name| response.header(name).map(|v| ((*name).to_owned(), v.to_owned())))
            .collect();

        let mut body = Vec::new();
        if request.method != Method::Head {
            let mut chunk = [0_u8; 512];
            loop {
                match response.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) if body.len() + n > MAX_BODY_LEN => {
                        warn!("HTTP: body from {} exceeds {} bytes", request.url, MAX_BODY_LEN);
                        return Err(TransportError::Io);
                    }
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                    Err(_) => return Err(TransportError::Io),
                }
            }
        }

        Ok(HttpResponse { status, headers, body })
    }
}

#[cfg(target_os = "espidf")]
pub(crate) use platform::{client, svc_method};

impl HttpTransport for EspHttpTransport {
    fn is_connected(&self) -> bool {
        crate::adapters::wifi::sta_connected()
    }

    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        #[cfg(target_os = "espidf")]
        {
            platform::send(request)
        }

        #[cfg(not(target_os = "espidf"))]
        {
            log::debug!("HTTP(sim): {} {} dropped", request.method, request.url);
            Err(TransportError::NotConnected)
        }
    }
}
