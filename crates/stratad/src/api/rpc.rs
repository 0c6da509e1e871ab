//! `POST /rpc/{service}/{method}`: one RPC call per request.
//!
//! The JSON body is the request message and the headers are the call
//! metadata. Unary calls answer with a JSON body; server-streaming calls
//! answer with server-sent events, one `message` event per item and a
//! terminal `error` event if the stream fails.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Status;
use crate::pipeline::CallContext;
use crate::rpc::{not_served, Handler};
use crate::state::AppState;

fn parse_body(body: &Bytes) -> Result<Value, Status> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|err| Status::invalid_argument(format!("request body is not valid JSON: {err}")))
}

fn sse_event(item: Result<Value, Status>) -> Event {
    let (name, data) = match item {
        Ok(value) => ("message", serde_json::to_string(&value)),
        Err(status) => ("error", serde_json::to_string(&status)),
    };
    match data {
        Ok(data) => Event::default().event(name).data(data),
        Err(_) => Event::default().event("error").data("encoding failure"),
    }
}

/// POST /rpc/:service/:method
pub async fn call(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path((service, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match parse_body(&body) {
        Ok(request) => request,
        Err(status) => return status.into_response(),
    };

    let method = format!("/{service}/{method}");
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let client_ip = state.rate_limit.client_ip(peer.map(|p| p.ip()), &headers);

    // dropped with the response (or its stream) when the client goes away
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let ctx = CallContext::new(method.clone(), headers)
        .with_peer(peer, client_ip)
        .with_cancel(cancel);

    let services = state.services().clone();
    match state.registry.get(&method) {
        Some(Handler::Streaming(handler)) => {
            let result = state
                .pipeline
                .invoke_stream(ctx, request, move |ctx, req| handler(services, ctx, req))
                .await;
            match result {
                Ok(stream) => {
                    let events = stream.map(move |item| {
                        let _guard = &guard;
                        Ok::<_, Infallible>(sse_event(item))
                    });
                    Sse::new(events)
                        .keep_alive(KeepAlive::default())
                        .into_response()
                }
                Err(status) => status.into_response(),
            }
        }
        Some(Handler::Unary(handler)) => {
            let result = state
                .pipeline
                .invoke(ctx, request, move |ctx, req| handler(services, ctx, req))
                .await;
            drop(guard);
            respond(result)
        }
        None => {
            let result = state
                .pipeline
                .invoke(ctx, request, move |ctx, req| not_served(services, ctx, req).boxed())
                .await;
            drop(guard);
            respond(result)
        }
    }
}

fn respond(result: Result<Value, Status>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(status) => status.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_null_request() {
        assert_eq!(parse_body(&Bytes::from_static(b"")).unwrap(), Value::Null);
        assert_eq!(parse_body(&Bytes::from_static(b" \n")).unwrap(), Value::Null);
        assert!(parse_body(&Bytes::from_static(b"{")).is_err());
    }
}
