use anyhow::Result;
use async_trait::async_trait;
use callcore::net::{HttpClient, HttpRequest, HttpResponse, StreamingHttpResponse};
use ureq::Agent;

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Non-2xx responses are returned as responses rather than errors: calling
/// backends put the failure reason in the JSON body.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        let config = Agent::config_builder().http_status_as_error(false).build();
        Self {
            agent: Agent::new_with_config(config),
        }
    }

    fn call(agent: &Agent, request: HttpRequest) -> Result<ureq::http::Response<ureq::Body>> {
        let response = match request.method.as_str() {
            "GET" => {
                let mut req = agent.get(&request.url);
                for (key, value) in &request.headers {
                    req = req.header(key, value);
                }
                req.call()?
            }
            "POST" => {
                let mut req = agent.post(&request.url);
                for (key, value) in &request.headers {
                    req = req.header(key, value);
                }
                if let Some(body) = request.body {
                    req.send(&body[..])?
                } else {
                    req.send(&[])?
                }
            }
            method => {
                return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
            }
        };
        Ok(response)
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        // Since ureq is blocking, we must use spawn_blocking
        tokio::task::spawn_blocking(move || {
            let response = Self::call(&agent, request)?;
            let status_code = response.status().as_u16();

            let mut body = response.into_body();
            let body_bytes = body.read_to_vec()?;

            Ok(HttpResponse {
                status_code,
                body: body_bytes,
            })
        })
        .await?
    }

    fn execute_streaming(&self, request: HttpRequest) -> Result<StreamingHttpResponse> {
        // Called from a blocking thread that keeps reading the body
        // for as long as the stream stays open.
        if request.method != "GET" {
            return Err(anyhow::anyhow!(
                "Streaming only supports GET, got: {}",
                request.method
            ));
        }
        let response = Self::call(&self.agent, request)?;

        let status_code = response.status().as_u16();
        let reader = response.into_body().into_reader();

        Ok(StreamingHttpResponse {
            status_code,
            body: Box::new(reader),
        })
    }
}
