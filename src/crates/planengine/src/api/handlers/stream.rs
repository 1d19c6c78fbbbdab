//! `POST /api/stream_execute_vm`: the one route that creates a task. Mirrors
//! the Flask original's `Response(stream_with_context(event_stream()),
//! mimetype="text/event-stream", headers={"X-Content-Type-Options": "nosniff"})`
//! — raw `"<code>:<json>\n"` lines, not SSE `data: ...\n\n` framing.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::error::ApiResult;
use crate::api::models::StreamExecuteRequest;
use crate::api::routes::AppState;
use crate::streaming::{stream_queue, StreamingProtocol};
use crate::task::goal_format::parse_goal_response_format;

pub async fn stream_execute_vm(
    State(app_state): State<AppState>,
    Json(req): Json<StreamExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    let (clean_goal, response_format) = if req.response_format.is_none() {
        parse_goal_response_format(&req.goal)
    } else {
        (req.goal.clone(), req.response_format.clone())
    };
    let meta = response_format.map(|rf| serde_json::json!({"response_format": rf}));

    let task = app_state.tasks.create_task(&clean_goal, req.namespace_name.as_deref(), meta).await?;

    let (producer, mut consumer, done_guard) = stream_queue();

    tokio::spawn(async move {
        if let Err(err) = task.execute_streaming(&producer).await {
            // `execute_streaming` only emits wire events once the plan is
            // generated and the step loop starts; a failure before that
            // point (e.g. plan generation itself failing) reaches here
            // having sent nothing, so the client still needs a terminal
            // event rather than a silently truncated stream.
            tracing::error!(error = %err, "stream_execute_vm failed before any step ran");
            producer.send_chunk(StreamingProtocol::error_part(&err.to_string()).to_line());
            producer.send_chunk(StreamingProtocol::finish_message("error", None).to_line());
        }
        done_guard.mark_done();
    });

    let body_stream = futures::stream::unfold(consumer, |mut consumer| async move {
        consumer.poll_next().await.map(|chunk| (Ok::<_, std::convert::Infallible>(Bytes::from(chunk)), consumer))
    });

    let body = Body::from_stream(body_stream);

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::HeaderName::from_static("x-content-type-options"), "nosniff"),
        ],
        body,
    ))
}
