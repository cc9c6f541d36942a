use crate::config::ClientConfig;
use crate::error::Error;
use futures::future::BoxFuture;
use log::{debug, info};
use reqwest::{Certificate, Client};
use serde_json::Value;
use std::time::Duration;
use url::Url;

const LOOKUP_TIMEOUT: u64 = 10;

/// Resolves how many participants a conversation has, so latencies can be
/// bucketed by conversation size.
pub trait ConversationSizeLookup: Send + Sync {
    fn conversation_size<'a>(
        &'a self,
        server_url: &'a str,
        conversation_id: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<usize, Error>>;
}

/// `GET /api/conversations/{id}` on the chat service's REST API, authorized with
/// the bearer token of one test account.
#[derive(Debug, Clone)]
pub struct HttpConversationLookup {
    client: Client,
    headers: Vec<(String, String)>,
}

impl HttpConversationLookup {
    pub fn new(client_config: ClientConfig) -> Result<Self, Error> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(LOOKUP_TIMEOUT))
            // The websocket clients dial the service directly, so does the lookup
            .no_proxy();

        if let Some(path) = client_config.ca_file.as_deref() {
            let pem = std::fs::read(path)?;
            builder = builder.tls_built_in_root_certs(false);
            for cert in Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        Ok(Self {
            client: builder.build()?,
            headers: client_config.headers,
        })
    }

    async fn fetch(
        &self,
        server_url: &str,
        conversation_id: &str,
        token: &str,
    ) -> Result<usize, Error> {
        let url = conversation_url(server_url, conversation_id)?;
        info!("getting conversation info from {}", url);

        let mut request = self.client.get(&url).bearer_auth(token);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        debug!("conversation lookup answered with status {}", response.status());
        let document = response.error_for_status()?.json::<Value>().await?;

        let size = participant_count(&document);
        info!("found {} participants in conversation {}", size, conversation_id);
        Ok(size)
    }
}

impl ConversationSizeLookup for HttpConversationLookup {
    fn conversation_size<'a>(
        &'a self,
        server_url: &'a str,
        conversation_id: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(self.fetch(server_url, conversation_id, token))
    }
}

/// REST endpoint of a conversation, derived from the websocket base address.
pub fn conversation_url(server_url: &str, conversation_id: &str) -> Result<String, Error> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(Error::InvalidSchemeURL(other.to_string())),
    };
    let _ = url.set_scheme(scheme);

    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/api/conversations/{}", base, conversation_id));
    url.set_query(None);
    Ok(url.to_string())
}

/// Length of the `participants` array, zero when the field is missing.
pub fn participant_count(document: &Value) -> usize {
    document
        .get("participants")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}
