use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use qproxy_rs::eventstream::encode_event_frame;
use serde_json::json;
use tokio::net::TcpListener;

const DEFAULT_BACKEND_PORT: u16 = 19_002;
const GENERATE_PATH: &str = "/generateAssistantResponse";

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Tool,
    Corrupt,
    Truncated,
    Error,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::Tool => "tool",
            MockScenario::Corrupt => "corrupt",
            MockScenario::Truncated => "truncated",
            MockScenario::Error => "error",
        }
    }
}

struct MockState {
    scenario: MockScenario,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("BACKEND_PORT", DEFAULT_BACKEND_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock backend on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock backend listening on 127.0.0.1:{port} (scenario={})",
        state.scenario.as_str()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock backend connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("tool") => MockScenario::Tool,
        Ok("corrupt") => MockScenario::Corrupt,
        Ok("truncated") => MockScenario::Truncated,
        Ok("error") => MockScenario::Error,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &MockState) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    if parts.method == Method::GET && parts.uri.path() == "/_mock/stats" {
        let requests = state.requests.load(Ordering::Relaxed);
        let stats = format!(
            "{{\"scenario\":\"{}\",\"requests\":{requests}}}",
            state.scenario.as_str()
        );
        return simple_response(StatusCode::OK, "application/json", Bytes::from(stats));
    }
    if parts.method != Method::POST || parts.uri.path() != GENERATE_PATH {
        return simple_response(
            StatusCode::NOT_FOUND,
            "application/json",
            Bytes::from_static(br#"{"message":"not found"}"#),
        );
    }
    state.requests.fetch_add(1, Ordering::Relaxed);

    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if !bearer {
        return simple_response(
            StatusCode::FORBIDDEN,
            "application/json",
            Bytes::from_static(br#"{"message":"missing bearer token"}"#),
        );
    }
    if serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("conversationState").cloned())
        .is_none()
    {
        return simple_response(
            StatusCode::BAD_REQUEST,
            "application/json",
            Bytes::from_static(br#"{"message":"Improperly formed request."}"#),
        );
    }

    match state.scenario {
        MockScenario::Error => simple_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "application/json",
            Bytes::from_static(br#"{"message":"mock injected error"}"#),
        ),
        scenario => event_stream_response(scenario_body(scenario)),
    }
}

fn push_event(out: &mut BytesMut, event_type: &str, payload: &serde_json::Value) {
    match encode_event_frame(event_type, payload.to_string().as_bytes()) {
        Ok(frame) => out.extend_from_slice(&frame),
        Err(err) => eprintln!("failed to encode mock frame: {err}"),
    }
}

fn scenario_body(scenario: MockScenario) -> Bytes {
    let mut out = BytesMut::new();
    match scenario {
        MockScenario::Text | MockScenario::Error => {
            push_event(&mut out, "assistantResponseEvent", &json!({"content": "Hi"}));
            push_event(&mut out, "assistantResponseEvent", &json!({"content": " there"}));
            push_event(&mut out, "messageStopEvent", &json!({"stopReason": "end_turn"}));
        }
        MockScenario::Tool => {
            push_event(
                &mut out,
                "assistantResponseEvent",
                &json!({"content": "Checking the weather."}),
            );
            push_event(
                &mut out,
                "toolUseEvent",
                &json!({"toolUseId": "tooluse_mock", "name": "get_weather"}),
            );
            push_event(
                &mut out,
                "toolUseEvent",
                &json!({"toolUseId": "tooluse_mock", "input": "{\"city\":"}),
            );
            push_event(
                &mut out,
                "toolUseEvent",
                &json!({"toolUseId": "tooluse_mock", "input": "\"SF\"}", "stop": true}),
            );
            push_event(&mut out, "messageStopEvent", &json!({"stopReason": "tool_use"}));
        }
        MockScenario::Corrupt => {
            push_event(&mut out, "assistantResponseEvent", &json!({"content": "Hi"}));
            // damaged message checksums force the proxy into text recovery
            for text in [" the", "re", "!"] {
                let start = out.len();
                push_event(&mut out, "assistantResponseEvent", &json!({"content": text}));
                let last = out.len() - 1;
                if last > start {
                    out[last] ^= 0xff;
                }
            }
            push_event(&mut out, "messageStopEvent", &json!({"stopReason": "end_turn"}));
        }
        MockScenario::Truncated => {
            push_event(&mut out, "assistantResponseEvent", &json!({"content": "Hi"}));
            push_event(
                &mut out,
                "toolUseEvent",
                &json!({"toolUseId": "tooluse_cut", "name": "search"}),
            );
            let start = out.len();
            push_event(
                &mut out,
                "toolUseEvent",
                &json!({"toolUseId": "tooluse_cut", "input": "{\"q\":\"rust\"}"}),
            );
            out.truncate(start + (out.len() - start) / 2);
        }
    }
    out.freeze()
}

fn event_stream_response(body: Bytes) -> Response<Full<Bytes>> {
    simple_response(StatusCode::OK, "application/vnd.amazon.eventstream", body)
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
