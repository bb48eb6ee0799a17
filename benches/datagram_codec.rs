use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use fleetlink::protocol::types::timestamp;
use fleetlink::protocol::{
    outbound, Acknowledge, GenericContent, InboundMessage, Level, NotificationContent,
    NotifyVehicle,
};

const UPDATE_VEHICLE: &[u8] = br#"{"index":42,"type":"update_vehicle","timestamp":"2025-01-01T00:00:00.000Z","vehicle":{"vin":"VIN-0001","position":{"lat":48.4,"lon":17.1},"speedFrontLeft":13.2,"speedFrontRight":13.1,"laneId":"L2"}}"#;

const NOTIFY: &[u8] = br#"{"index":43,"type":"notify","timestamp":"2025-01-01T00:00:00.000Z","vehicleId":3,"level":"danger","contentType":"head_collision","content":{"targetVehicleId":7,"timeToCollision":1.2,"maxSpeedExceededBy":14.0,"breakingDistanceDiff":3.5}}"#;

fn decode_inbound(c: &mut Criterion) {
    let mut bench = c.benchmark_group("decoding");
    bench.throughput(Throughput::Elements(1));

    bench.bench_function("decode_update_vehicle", |b| {
        b.iter(|| InboundMessage::decode(UPDATE_VEHICLE).unwrap());
    });

    bench.bench_function("decode_notify", |b| {
        b.iter(|| InboundMessage::decode(NOTIFY).unwrap());
    });
}

fn encode_outbound(c: &mut Criterion) {
    let mut bench = c.benchmark_group("encoding");
    bench.throughput(Throughput::Elements(1));

    let stamp = timestamp::parse("2025-01-01T00:00:00.000Z").unwrap();
    bench.bench_function("encode_acknowledge", |b| {
        b.iter(|| outbound::encode(1, stamp, &Acknowledge { acknowledging_index: 42 }).unwrap());
    });

    let advisory = NotifyVehicle {
        level: Level::Warning,
        content: NotificationContent::Generic(GenericContent {
            text: "slow down".into(),
        }),
    };
    bench.bench_function("encode_notify_vehicle", |b| {
        b.iter(|| outbound::encode(2, stamp, &advisory).unwrap());
    });
}

criterion_group!(codec, decode_inbound, encode_outbound);
criterion_main!(codec);
