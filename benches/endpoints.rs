//! 请求热路径上的纯计算部分：通道选择与提示词渲染。

use std::collections::HashSet;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use modelgate::channels::{Channel, ChannelEntry, ChannelRegistry};
use modelgate::config::ChannelKind;
use modelgate::history::{ChatHistory, ChatMessage, Role};
use modelgate::transform::for_model;

fn registry(channels: usize) -> ChannelRegistry {
    let entries = (0..channels)
        .map(|i| {
            let entry = ChannelEntry::new(
                Channel {
                    id: format!("ch-{}", i),
                    name: format!("provider-{}", i),
                    kind: ChannelKind::Hosted,
                    base_url: "http://upstream.invalid".into(),
                    api_key: "sk-bench".into(),
                    models: vec!["gpt-4o-mini".into(), "llama3-8b".into()],
                    priority: (i % 4) as i32,
                    quota_limit: None,
                    model_dir: None,
                    context_size: None,
                },
                0,
                true,
            );
            entry.observe_latency((i as i64 * 37) % 900);
            Arc::new(entry)
        })
        .collect();
    ChannelRegistry::new(entries)
}

fn history(turns: usize) -> ChatHistory {
    let mut messages = vec![ChatMessage::new(Role::System, "You are a helpful assistant.")];
    for i in 0..turns {
        messages.push(ChatMessage::new(
            Role::User,
            format!("Question number {} about the state of things?", i),
        ));
        messages.push(ChatMessage::new(
            Role::Assistant,
            "It depends on quite a few factors, let me explain.",
        ));
    }
    messages.into_iter().collect()
}

fn bench_channel_select(c: &mut Criterion) {
    let registry = registry(32);
    let excluded = HashSet::new();
    c.bench_function("select_among_32_channels", |b| {
        b.iter(|| registry.select(std::hint::black_box("llama3-8b"), &excluded).unwrap())
    });
}

fn bench_prompt_render(c: &mut Criterion) {
    let llama3 = for_model("llama3-8b");
    let instruct = for_model("mistral-7b");
    let history = history(16);

    c.bench_function("render_llama3_16_turns", |b| {
        b.iter(|| llama3.render(std::hint::black_box(&history)))
    });
    c.bench_function("render_instruct_16_turns", |b| {
        b.iter(|| instruct.render(std::hint::black_box(&history)))
    });
}

criterion_group!(benches, bench_channel_select, bench_prompt_render);
criterion_main!(benches);
