use crate::error::Error;
use url::Url;

/// Where a request goes and how to reach it, extracted from a ws/wss/http/https URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub host: String,
    pub host_with_port: String,
    pub host_header: String,
    pub path_and_query: String,
    pub use_tls: bool,
}

pub fn parse_target(raw_url: &str) -> Result<Target, Error> {
    let parsed_url = Url::parse(raw_url)?;

    // We need the default port for the scheme, in the case the URL
    // is a domain without an explicit port
    let (default_port, use_tls) = match parsed_url.scheme() {
        "ws" | "http" => (80, false),
        "wss" | "https" => (443, true),
        scheme => return Err(Error::InvalidSchemeURL(scheme.to_string())),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    if host.is_empty() {
        return Err(Error::URLNoHost);
    }
    let port = parsed_url.port().unwrap_or(default_port);

    // The Host header only carries the port when it was given explicitly
    let host_header = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    Ok(Target {
        host: String::from(host),
        host_with_port: format!("{}:{}", host, port),
        host_header,
        path_and_query,
        use_tls,
    })
}

// Since we already have all the info, it isn't worth converting everything to a HTTP request type,
// we simply build the string, and convert it to bytes when sending to the server
pub fn construct_upgrade_request(
    target: &Target,
    key: &str,
    headers: &[(String, String)],
) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        target.path_and_query, target.host_header, key,
    );
    append_headers(&mut request, headers);
    request.push_str("\r\n");
    request
}

fn append_headers(request: &mut String, headers: &[(String, String)]) {
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
}

pub trait ResponseExt {
    fn get_header_value(&self, header_name: &str) -> Option<String>;
}

impl<'a, 'b> ResponseExt for httparse::Response<'a, 'b> {
    fn get_header_value(&self, header_name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(header_name))
            .map(|header| String::from_utf8_lossy(header.value).to_string())
    }
}
