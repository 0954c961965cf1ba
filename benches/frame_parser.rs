use std::collections::VecDeque;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chat_relay::stream::{classify_frame, encode_event, FrameBuffer, OutboundEvent, ProviderFrame};

fn sample_stream(fragments: usize) -> Vec<u8> {
    let mut out = String::new();
    for index in 0..fragments {
        let payload = serde_json::json!({
            "id": "chatcmpl_bench",
            "object": "chat.completion.chunk",
            "choices": [{ "index": 0, "delta": { "content": format!("token{index} ") } }]
        });
        out.push_str("data: ");
        out.push_str(&payload.to_string());
        out.push_str("\n\n");
    }
    out.push_str("data: [DONE]\n\n");
    out.into_bytes()
}

fn bench_frame_buffer(c: &mut Criterion) {
    let stream = sample_stream(256);

    for chunk_size in [16usize, 512, 8192] {
        c.bench_function(&format!("frame_buffer_chunk_{chunk_size}"), |b| {
            b.iter(|| {
                let mut buffer = FrameBuffer::new();
                let mut frames = VecDeque::with_capacity(8);
                let mut count = 0usize;
                for chunk in stream.chunks(chunk_size) {
                    buffer.push(black_box(chunk), &mut frames);
                    count += frames.len();
                    frames.clear();
                }
                black_box(count);
            });
        });
    }
}

fn bench_classify(c: &mut Criterion) {
    let content = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello there\"}}]}";
    let role_only = "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}";

    c.bench_function("classify_content_frame", |b| {
        b.iter(|| {
            let frame = classify_frame(black_box(content));
            assert!(matches!(frame, ProviderFrame::ContentDelta(_)));
        });
    });
    c.bench_function("classify_role_only_frame", |b| {
        b.iter(|| black_box(classify_frame(black_box(role_only))));
    });
    c.bench_function("classify_done_frame", |b| {
        b.iter(|| black_box(classify_frame(black_box("data: [DONE]"))));
    });
}

fn bench_encode(c: &mut Criterion) {
    let event = OutboundEvent::Content("Hello \"world\"\nnext line".to_string());
    c.bench_function("encode_content_event", |b| {
        b.iter(|| black_box(encode_event(black_box(&event))));
    });
}

criterion_group!(benches, bench_frame_buffer, bench_classify, bench_encode);
criterion_main!(benches);
