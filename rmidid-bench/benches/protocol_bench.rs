//! Codec and framing benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rmidid_protocol::buffer::{ByteReader, ByteWriter};
use rmidid_protocol::midi::{encode_events, MidiDecoder, MidiEvent};
use rmidid_protocol::{
    ClockSyncPacket, CommandKind, ControlPacket, ExchangePacket, MidiPacket, MidiPacketHeader,
};

fn test_events(count: usize) -> Vec<MidiEvent> {
    (0..count)
        .map(|i| match i % 3 {
            0 => MidiEvent::NoteOn {
                channel: (i % 16) as u8,
                key: 60,
                velocity: 100,
            },
            1 => MidiEvent::ControlChange {
                channel: (i % 16) as u8,
                controller: 64,
                value: 127,
            },
            _ => MidiEvent::PitchBend {
                channel: (i % 16) as u8,
                value: (i as i16 % 8192) - 4096,
            },
        })
        .collect()
}

fn encode_to_vec(events: &[MidiEvent]) -> Vec<u8> {
    let mut storage = vec![0u8; events.len() * 3];
    let mut writer = ByteWriter::new(&mut storage);
    encode_events(events, &mut writer).unwrap();
    let len = writer.written();
    storage.truncate(len);
    storage
}

fn bench_midi_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("midi_encode");

    for count in [1, 8, 64, 512] {
        let events = test_events(count);
        let mut storage = vec![0u8; count * 3];

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| {
                let mut writer = ByteWriter::new(&mut storage);
                encode_events(events, &mut writer).unwrap();
                black_box(writer.written())
            });
        });
    }

    group.finish();
}

fn bench_midi_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("midi_decode");

    for count in [1, 8, 64, 512] {
        let encoded = encode_to_vec(&test_events(count));

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| {
                let events: Result<Vec<_>, _> = MidiDecoder::new(encoded).collect();
                black_box(events.unwrap())
            });
        });
    }

    group.finish();
}

fn bench_exchange_roundtrip(c: &mut Criterion) {
    let packet = ExchangePacket {
        command: CommandKind::Invitation,
        initiator_token: 0x12345678,
        ssrc: 0xAABBCCDD,
        name: "bench-endpoint".into(),
    };
    let mut storage = [0u8; 256];
    let encoded = {
        let mut writer = ByteWriter::new(&mut storage);
        packet.encode(&mut writer).unwrap();
        let len = writer.written();
        storage[..len].to_vec()
    };

    c.bench_function("exchange_encode", |b| {
        b.iter(|| {
            let mut writer = ByteWriter::new(&mut storage);
            packet.encode(&mut writer).unwrap();
            black_box(writer.written())
        });
    });

    c.bench_function("control_decode", |b| {
        b.iter(|| black_box(ControlPacket::decode(&encoded).unwrap()));
    });
}

fn bench_clock_sync_decode(c: &mut Criterion) {
    let mut storage = [0u8; 64];
    let encoded = {
        let mut writer = ByteWriter::new(&mut storage);
        ClockSyncPacket {
            ssrc: 0xAABBCCDD,
            count: 1,
            timestamps: [123456, 234567, 0],
        }
        .encode(&mut writer)
        .unwrap();
        let len = writer.written();
        storage[..len].to_vec()
    };

    c.bench_function("clock_sync_decode", |b| {
        b.iter(|| black_box(ControlPacket::decode(&encoded).unwrap()));
    });
}

fn bench_data_packet(c: &mut Criterion) {
    let midi = encode_to_vec(&test_events(5));
    let header = MidiPacketHeader {
        sequence: 42,
        timestamp: 123456,
        ssrc: 0xAABBCCDD,
    };
    let mut storage = [0u8; 64];
    let encoded = {
        let mut writer = ByteWriter::new(&mut storage);
        MidiPacket::encode(header, &midi, &mut writer).unwrap();
        let len = writer.written();
        storage[..len].to_vec()
    };

    c.bench_function("data_packet_encode", |b| {
        b.iter(|| {
            let mut writer = ByteWriter::new(&mut storage);
            MidiPacket::encode(header, &midi, &mut writer).unwrap();
            black_box(writer.written())
        });
    });

    c.bench_function("data_packet_decode", |b| {
        b.iter(|| black_box(MidiPacket::decode(&encoded).unwrap()));
    });
}

fn bench_reader_primitives(c: &mut Criterion) {
    let data = [0u8; 64];

    c.bench_function("reader_u32_sweep", |b| {
        b.iter(|| {
            let mut reader = ByteReader::new(&data);
            let mut acc = 0u32;
            while reader.remaining() >= 4 {
                acc = acc.wrapping_add(reader.read_u32().unwrap());
            }
            black_box(acc)
        });
    });
}

criterion_group!(
    benches,
    bench_midi_encode,
    bench_midi_decode,
    bench_exchange_roundtrip,
    bench_clock_sync_decode,
    bench_data_packet,
    bench_reader_primitives,
);

criterion_main!(benches);
