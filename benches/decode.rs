use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qproxy_rs::convert::StreamConverter;
use qproxy_rs::eventstream::{decode_frame, encode_event_frame, scan_for_events, FrameRouter};
use qproxy_rs::stream::{encode_stream_events_into, StreamPipeline};
use serde_json::json;

fn backend_body(text_frames: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for i in 0..text_frames {
        let payload = json!({ "content": format!("chunk {i} of a reasonably sized reply ") });
        body.extend_from_slice(
            &encode_event_frame("assistantResponseEvent", payload.to_string().as_bytes())
                .expect("encode"),
        );
    }
    for payload in [
        json!({"toolUseId": "tooluse_1", "name": "get_weather"}),
        json!({"toolUseId": "tooluse_1", "input": "{\"city\":\"San Francisco\"}", "stop": true}),
    ] {
        body.extend_from_slice(
            &encode_event_frame("toolUseEvent", payload.to_string().as_bytes()).expect("encode"),
        );
    }
    body.extend_from_slice(
        &encode_event_frame("messageStopEvent", br#"{"stopReason":"tool_use"}"#).expect("encode"),
    );
    body
}

fn bench_decode(c: &mut Criterion) {
    let single = encode_event_frame("assistantResponseEvent", br#"{"content":"Hello, world"}"#)
        .expect("encode");
    c.bench_function("decode_single_frame", |b| {
        b.iter(|| decode_frame(black_box(&single)).expect("decode"));
    });

    let body = backend_body(200);
    c.bench_function("route_200_frames_4k_chunks", |b| {
        b.iter(|| {
            let mut router = FrameRouter::default();
            let mut events = Vec::with_capacity(256);
            for chunk in black_box(&body).chunks(4096) {
                router.push_into(chunk, &mut events);
            }
            router.finish_into(&mut events);
            events
        });
    });

    let text: String = (0..200)
        .map(|i| format!("junk{{\"content\":\"chunk {i} with {{braces}} inside\"}}"))
        .collect();
    c.bench_function("scan_200_objects", |b| {
        b.iter(|| scan_for_events(black_box(text.as_bytes())).count());
    });
}

fn bench_convert(c: &mut Criterion) {
    let body = backend_body(200);
    c.bench_function("pipeline_200_frames_to_sse", |b| {
        b.iter(|| {
            let mut pipeline = StreamPipeline::new(
                FrameRouter::default(),
                StreamConverter::new("msg_bench", "claude-sonnet-4", 100),
            );
            let mut events = Vec::with_capacity(256);
            for chunk in black_box(&body).chunks(4096) {
                pipeline.feed_into(chunk, &mut events);
            }
            pipeline.finish_into(&mut events);
            let mut frames = Vec::with_capacity(events.len());
            encode_stream_events_into(events, &mut frames);
            frames
        });
    });
}

criterion_group!(benches, bench_decode, bench_convert);
criterion_main!(benches);
