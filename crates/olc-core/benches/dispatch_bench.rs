//! Criterion benchmarks for olc-core dispatch paths
//!
//! Run with: cargo bench -p olc-core

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use crossbeam_channel::unbounded;
use olc_core::sim::{LoopbackSatellite, RecordingVoter, ResponseMode};
use olc_core::{
    BitMaskPool, CommandMsg, DataBuffer, DataMsg, GraphMgmtPayload, GraphOpenPayload, ModuleCfg, ModuleId, Olc,
    OlcParams, Opcode, ParamPayload, Payload, PerfMode, PortRef, SubGraphCfg, SubGraphId,
};

const IN: PortRef = PortRef::new(0x10, 1);

fn started_container(mode: ResponseMode) -> Olc {
    let sat = LoopbackSatellite::new().with_response_mode(mode);
    let mut olc = Olc::create(OlcParams::default(), Box::new(sat), Box::new(RecordingVoter::new())).unwrap();
    let open = GraphOpenPayload {
        sub_graphs: vec![SubGraphCfg {
            id: SubGraphId(1),
            perf_mode: PerfMode::LowLatency,
        }],
        modules: vec![ModuleCfg {
            id: ModuleId(0x10),
            sub_graph: SubGraphId(1),
        }],
        ext_inputs: vec![IN],
        ..GraphOpenPayload::default()
    };
    let handle = olc.handle();
    handle
        .send(CommandMsg::new(Opcode::GraphOpen, Payload::GraphOpen(open)))
        .unwrap();
    for op in [Opcode::GraphPrepare, Opcode::GraphStart] {
        let mgmt = GraphMgmtPayload {
            sub_graphs: vec![SubGraphId(1)],
            ports: Vec::new(),
        };
        handle.send(CommandMsg::new(op, Payload::GraphMgmt(mgmt))).unwrap();
    }
    olc.run_until_idle();
    olc
}

// ============================================================================
// Command round trips
// ============================================================================

fn bench_command_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("Command_RoundTrip");

    for (name, mode) in [("inline", ResponseMode::Inline), ("deferred", ResponseMode::Deferred)] {
        let mut olc = started_container(mode);
        let handle = olc.handle();
        let (tx, rx) = unbounded();
        group.bench_with_input(BenchmarkId::new("set_cfg", name), &mode, |b, _| {
            b.iter(|| {
                let param = ParamPayload::new(0x10, 0x0800_2000, vec![1, 0, 0, 0]);
                let cmd = CommandMsg::new(Opcode::SetCfg, Payload::ParamCfg(vec![param])).with_responder(tx.clone());
                handle.send(cmd).unwrap();
                olc.run_until_idle();
                black_box(rx.try_recv().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_unsupported_opcode(c: &mut Criterion) {
    let mut olc = started_container(ResponseMode::Deferred);
    let handle = olc.handle();
    let (tx, rx) = unbounded();
    c.bench_function("Command_Unsupported", |b| {
        b.iter(|| {
            handle
                .send(CommandMsg::new(Opcode::Other(0x77), Payload::Empty).with_responder(tx.clone()))
                .unwrap();
            olc.run_until_idle();
            black_box(rx.try_recv().unwrap())
        });
    });
}

// ============================================================================
// Data path
// ============================================================================

fn bench_input_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("Input_Write");

    for size in [192usize, 1920, 7680] {
        let mut olc = started_container(ResponseMode::Deferred);
        let data = olc.ext_in_port(IN).unwrap().data_handle();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                data.push(DataMsg::Buffer(DataBuffer::filled(vec![0; size]))).unwrap();
                black_box(olc.run_until_idle())
            });
        });
    }

    group.finish();
}

// ============================================================================
// Bit pool
// ============================================================================

fn bench_bit_pool(c: &mut Criterion) {
    c.bench_function("BitMaskPool_RequestRelease", |b| {
        let mut pool = BitMaskPool::new();
        b.iter(|| {
            let bits: Vec<u32> = (0..8).filter_map(|_| pool.request()).collect();
            for bit in &bits {
                pool.release(*bit);
            }
            black_box(bits)
        });
    });
}

criterion_group!(
    benches,
    bench_command_round_trip,
    bench_unsupported_opcode,
    bench_input_write,
    bench_bit_pool
);
criterion_main!(benches);
