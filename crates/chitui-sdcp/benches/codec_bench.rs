// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for SDCP frame decoding and request encoding in the
// chitui-sdcp crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use chitui_sdcp::codec::{OutboundRequest, decode, encode};
use chitui_sdcp::command::Command;

const STATUS_FRAME: &str = r#"{"Status":{"CurrentStatus":[1],"PreviousStatus":0,"PrintScreen":1234.5,
"ReleaseFilm":812,"TempOfUVLED":31.2,"TimeLapseStatus":0,"PrintInfo":{"Status":3,"CurrentLayer":152,
"TotalLayer":1200,"CurrentTicks":912000,"TotalTicks":7200000,"Filename":"benchy.ctb","ErrorNumber":0,
"TaskId":"5e8d2b7a-0c33-4a3c-9e1e-0a3d7e1f4b12"}},"MainboardID":"000000000001d354",
"TimeStamp":1700000000,"Topic":"sdcp/status/000000000001d354"}"#;

/// Build a file-list response with `n` entries.
fn file_list_frame(n: usize) -> String {
    let entries: Vec<String> = (0..n)
        .map(|i| format!(r#"{{"name":"/local/model_{i}.ctb","type":1,"usedSize":{}}}"#, i * 1024))
        .collect();
    format!(
        r#"{{"Id":"c","Data":{{"Cmd":258,"RequestID":"0011223344556677","MainboardID":"000000000001d354",
"TimeStamp":1700000000,"Data":{{"Ack":0,"FileList":[{}]}}}},"Topic":"sdcp/response/000000000001d354"}}"#,
        entries.join(",")
    )
}

fn bench_decode_status(c: &mut Criterion) {
    c.bench_function("decode_status_frame", |b| {
        b.iter(|| decode(black_box(STATUS_FRAME)))
    });
}

fn bench_decode_file_list(c: &mut Criterion) {
    let frame = file_list_frame(200);
    c.bench_function("decode_file_list_200", |b| b.iter(|| decode(black_box(&frame))));
}

fn bench_encode(c: &mut Criterion) {
    let command = Command::StartPrint {
        filename: "/local/benchy.ctb".into(),
        start_layer: 0,
    };
    c.bench_function("encode_start_print", |b| {
        b.iter(|| {
            encode(black_box(&OutboundRequest {
                connection_id: "conn",
                device_id: "000000000001d354",
                correlation_id: "0011223344556677",
                timestamp: 1_700_000_000,
                command: &command,
            }))
        })
    });
}

criterion_group!(benches, bench_decode_status, bench_decode_file_list, bench_encode);
criterion_main!(benches);
