// codec_benchmark.rs - Performance benchmarks for the wire codecs
// =========================================================================
//
// Path building, tag request encoding, cyclic I/O datagrams and
// ListIdentity parsing. None of these touch the network.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use enip_scanner::cip::{self, CpfItem};
use enip_scanner::implicit::{network_parameters, ConnectionRequest, ForwardOpen, IoPacket};
use enip_scanner::tag::{build_read_request, build_write_request, TagValue};
use enip_scanner::{build_path, CipPath, DeviceIdentity};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn benchmark_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("cip_path");

    group.bench_function("assembly_data_path", |b| {
        b.iter(|| build_path(black_box(0x04), black_box(150), Some(3)))
    });
    group.bench_function("wide_instance_path", |b| {
        b.iter(|| {
            CipPath::new()
                .class(black_box(0x71))
                .instance(black_box(4001))
                .attribute(1)
        })
    });
    group.bench_function("connection_path", |b| {
        let request = ConnectionRequest::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 150, 100);
        b.iter(|| black_box(&request).connection_path())
    });

    group.finish();
}

fn benchmark_tag_requests(c: &mut Criterion) {
    let mut group = c.benchmark_group("tag_requests");

    for name in ["Counter", "Program:MainProgram.Conveyor_Speed"] {
        group.bench_with_input(BenchmarkId::new("read_request", name.len()), &name, |b, name| {
            b.iter(|| build_read_request(black_box(name)))
        });
    }

    let value = TagValue::Real(42.5);
    group.bench_function("write_request_real", |b| {
        b.iter(|| {
            let data = value.to_bytes().unwrap_or_default();
            build_write_request(black_box("Setpoint"), &data, value.cip_type().code())
        })
    });
    group.bench_function("decode_dint", |b| {
        let data = 1234i32.to_le_bytes();
        b.iter(|| TagValue::decode(black_box(0x00C4), black_box(&data)))
    });

    group.finish();
}

fn benchmark_io_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("io_packets");

    for size in [8usize, 64, 496] {
        let packet = IoPacket {
            connection_id: 0x1000_0001,
            sequence: 7,
            cip_sequence: 7,
            run_idle: Some(1),
            data: vec![0xA5; size],
        };
        let encoded = packet.encode();

        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, packet| {
            b.iter(|| black_box(packet).encode())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| IoPacket::decode(black_box(encoded), true))
        });
    }

    group.bench_function("forward_open", |b| {
        let request = ConnectionRequest::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 150, 100);
        let forward_open = ForwardOpen {
            o_to_t_connection_id: 0,
            t_to_o_connection_id: 0x2000_0001,
            connection_serial: 0x1234,
            vendor_id: 0x1337,
            originator_serial: 0x1234_5678,
            o_to_t_rpi: Duration::from_millis(10),
            o_to_t_parameters: network_parameters(22, true).unwrap_or_default(),
            t_to_o_rpi: Duration::from_millis(10),
            t_to_o_parameters: network_parameters(10, true).unwrap_or_default(),
            connection_path: request.connection_path(),
        };
        b.iter(|| black_box(&forward_open).encode())
    });

    group.finish();
}

fn benchmark_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");

    let identity = DeviceIdentity {
        ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
        reported_addr: None,
        vendor_id: 44,
        device_type: 0x0C,
        product_code: 0x1234,
        revision_major: 2,
        revision_minor: 7,
        status: 0x0030,
        serial_number: 0x00C0_FFEE,
        product_name: "Benchmark Adapter".to_string(),
        state: 3,
        online: true,
        rtt: Duration::ZERO,
    };
    let body = identity.encode_item();
    let payload = cip::encode_cpf(0, &[CpfItem::new(0x000C, body.clone())]).unwrap_or_default();

    group.bench_function("decode_identity_item", |b| {
        b.iter(|| DeviceIdentity::decode_item(black_box(&body), identity.ip, Duration::ZERO))
    });
    group.bench_function("decode_cpf", |b| {
        b.iter(|| cip::decode_cpf(black_box(&payload), 6))
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_paths,
    benchmark_tag_requests,
    benchmark_io_packets,
    benchmark_discovery
);
criterion_main!(benches);
