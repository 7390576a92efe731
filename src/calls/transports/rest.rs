//! JSON-over-HTTP delivery of control requests, shared by the webhook relay
//! and SSE transports.

use callcore::net::{HttpClient, HttpRequest};
use callcore::signaling::ControlEndpoint;
use callcore::{ControlCommand, ControlResponse};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::Arc;

use crate::calls::error::TransportError;

/// Paths of the backend control operations, relative to the backend URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlEndpoints {
    pub pre_accept: String,
    pub accept: String,
    pub terminate: String,
    pub dial: String,
}

impl ControlEndpoints {
    /// Routes of the webhook relay backend.
    pub fn webhook_relay() -> Self {
        Self {
            pre_accept: "/api/preaccept-call".into(),
            accept: "/api/accept-call".into(),
            terminate: "/api/terminate-call".into(),
            dial: "/api/make-call".into(),
        }
    }

    /// Routes of the WhatsApp Business API backend behind the SSE stream.
    pub fn waba() -> Self {
        Self {
            pre_accept: "/waba/pre-accept".into(),
            accept: "/waba/accept".into(),
            terminate: "/waba/terminate".into(),
            dial: "/waba/make-call".into(),
        }
    }

    pub fn path(&self, endpoint: ControlEndpoint) -> &str {
        match endpoint {
            ControlEndpoint::PreAccept => &self.pre_accept,
            ControlEndpoint::Accept => &self.accept,
            ControlEndpoint::Terminate => &self.terminate,
            ControlEndpoint::Dial => &self.dial,
        }
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Clone)]
pub struct RestControl {
    http: Arc<dyn HttpClient>,
    base_url: String,
    endpoints: ControlEndpoints,
}

impl RestControl {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        endpoints: ControlEndpoints,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            endpoints,
        }
    }

    pub fn url_for(&self, command: &ControlCommand) -> String {
        join_url(&self.base_url, self.endpoints.path(command.endpoint()))
    }

    pub async fn send(&self, command: ControlCommand) -> Result<ControlResponse, TransportError> {
        let url = self.url_for(&command);
        let request = HttpRequest::post(&url).with_json(&command.body())?;
        debug!(target: "Call/Control", "POST {url} ({})", command.name());

        let response = self.http.execute(request).await?;
        match serde_json::from_slice::<ControlResponse>(&response.body) {
            Ok(reply) => {
                if !reply.success {
                    warn!(
                        target: "Call/Control",
                        "{} rejected by backend: {}",
                        command.name(),
                        reply.error.as_deref().unwrap_or("no reason given")
                    );
                }
                Ok(reply)
            }
            // Some backends answer terminate with an empty 200.
            Err(_) if response.is_success() => Ok(ControlResponse::ok()),
            Err(_) => Err(TransportError::Http {
                status: response.status_code,
                body: response.body_string(),
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockHttpClient;
    use super::*;
    use callcore::types::CallId;

    fn accept() -> ControlCommand {
        ControlCommand::Accept {
            call_id: CallId::new("wacid.1"),
            sdp: "v=0".into(),
            phone_number_id: Some("42".into()),
        }
    }

    #[tokio::test]
    async fn test_posts_json_to_endpoint() {
        let http = Arc::new(MockHttpClient::default());
        http.reply(200, r#"{"success":true}"#);
        let rest = RestControl::new(
            http.clone(),
            "http://localhost:3000/",
            ControlEndpoints::webhook_relay(),
        );

        let reply = rest.send(accept()).await.unwrap();
        assert!(reply.success);

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[0].url, "http://localhost:3000/api/accept-call");
        assert_eq!(requests[0].method, "POST");
        assert_eq!(
            requests[0].headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        let body: serde_json::Value =
            serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["phone_number_id"], "42");
    }

    #[tokio::test]
    async fn test_reject_and_cancel_use_terminate_route() {
        let rest = RestControl::new(
            Arc::new(MockHttpClient::default()),
            "http://backend",
            ControlEndpoints::waba(),
        );
        let reject = ControlCommand::Reject {
            call_id: CallId::new("c"),
            phone_number_id: None,
        };
        assert_eq!(rest.url_for(&reject), "http://backend/waba/terminate");
    }

    #[tokio::test]
    async fn test_failure_bodies() {
        let http = Arc::new(MockHttpClient::default());
        http.reply(400, r#"{"success":false,"error":"486 Busy Here"}"#);
        http.reply(200, "");
        http.reply(502, "<html>Bad Gateway</html>");
        let rest = RestControl::new(http, "http://b", ControlEndpoints::webhook_relay());

        let reply = rest.send(accept()).await.unwrap();
        assert_eq!(reply.failure_text(), Some("486 Busy Here"));

        assert!(rest.send(accept()).await.unwrap().success);

        match rest.send(accept()).await {
            Err(TransportError::Http { status, .. }) => assert_eq!(status, 502),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            rest.send(accept()).await,
            Err(TransportError::Other(_))
        ));
    }
}
