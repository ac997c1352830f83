// cargo bench -- --save-baseline main
// cargo bench -- --baseline main
// --warm-up-time 0
//
// Decoding time of generated A2L descriptions and single read latency against the simulated ECU

#![allow(unused_imports)]

use log::{debug, error, info, trace, warn};

use std::{fmt::Write, sync::Arc};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use xcp_ecu_sim::{EcuSim, DEMO_A2L};
use xcp_monitor::a2l::A2lReader;
use xcp_monitor::acquisition::{Acquisition, AcquisitionConfig};
use xcp_monitor::catalog::{EcuDescriptor, MemoryCatalog, MemoryDescriptionSource};
use xcp_monitor::xcp::TcpConnector;

//-----------------------------------------------------------------------------
// Generated description with n measurements, n characteristics and n conversion methods

fn generate_a2l(n: usize) -> String {
    let mut s = String::from("ASAP2_VERSION 1 71\n/begin PROJECT bench \"\"\n  /begin MODULE bench_module \"\"\n");
    for i in 0..n {
        write!(
            s,
            "    /begin MEASUREMENT mea_{i}\n      LONGIDENTIFIER \"Measurement {i}\"\n      DATATYPE UWORD\n      ECU_ADDRESS 0x{:X}\n      UNIT \"rpm\"\n      COMPU_METHOD cm_{i}\n      /begin IF_DATA XCP /begin DAQ_EVENT FIXED_EVENT_LIST EVENT 1 /end DAQ_EVENT /end IF_DATA\n    /end MEASUREMENT\n",
            0x1000 + 2 * i,
        )
        .unwrap();
        write!(s, "    /begin CHARACTERISTIC cal_{i}\n      TYPE FLOAT32_IEEE\n      ECU_ADDRESS 0x{:X}\n    /end CHARACTERISTIC\n", 0x8000 + 4 * i).unwrap();
    }
    s.push_str("  /end MODULE\n");
    for i in 0..n {
        write!(s, "  /begin COMPU_METHOD cm_{i} \"\" RAT_FUNC \"%6.2\" \"rpm\"\n    COEFFS 4 1 0 0 0 1\n  /end COMPU_METHOD\n").unwrap();
    }
    s.push_str("/end PROJECT\n");
    s
}

fn a2l_benchmark(c: &mut Criterion) {
    let reader = A2lReader::new();
    let mut group = c.benchmark_group("a2l_decode");
    for n in [10, 100, 1000] {
        let text = generate_a2l(n);
        assert_eq!(reader.decode(&text).unwrap().definitions.len(), 2 * n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &text, |b, text| {
            b.iter(|| black_box(reader.decode(text).unwrap()));
        });
    }
    group.finish();
}

//-----------------------------------------------------------------------------
// Single read over TCP on localhost

fn read_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (sim, acq, id) = rt.block_on(async {
        let sim = EcuSim::start_demo("127.0.0.1:0").await.unwrap();
        let mut catalog = MemoryCatalog::new();
        catalog.add_ecu(EcuDescriptor::new(1, "bench", "127.0.0.1", sim.port(), "demo.a2l"));
        let source = Arc::new(MemoryDescriptionSource::new());
        source.insert("demo.a2l", DEMO_A2L);
        let acq = Acquisition::new(Arc::new(catalog), source, Arc::new(TcpConnector), AcquisitionConfig::default());
        acq.connect_ecu(1).await.unwrap();
        let id = acq.register_definition("engine_speed").unwrap();
        (sim, acq, id)
    });

    c.bench_function("read_once", |b| {
        b.iter(|| rt.block_on(acq.read_once(id)).unwrap());
    });

    rt.block_on(async {
        acq.disconnect().await;
        sim.shutdown().await;
    });
}

criterion_group!(benches, a2l_benchmark, read_benchmark);
criterion_main!(benches);
