#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use p7_protocol::utils::crypto::{SessionCipher, SymmetricCipher, IV_LEN, KEY_LEN};
use p7_protocol::{Checksum, Compression, FrameCodec, Message, MessageCodec, Specification};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

fn spec() -> Arc<Specification> {
    Arc::new(Specification::from_xml(include_str!("../specs/wired.xml")).unwrap())
}

fn file_entry(spec: &Arc<Specification>) -> Message {
    let mut message = Message::new(spec, "wired.file.file_list")
        .unwrap()
        .with("wired.file.path", "/Uploads/Software/archive-2.0.tar.gz")
        .unwrap()
        .with("wired.file.data_size", 48_213_904u64)
        .unwrap()
        .with("wired.file.labels", vec!["red".to_string(), "archive".to_string()])
        .unwrap();
    message
        .set_enum("wired.file.type", "wired.file.type.file")
        .unwrap();
    message.set_transaction_id(42).unwrap();
    message
}

fn bench_message_codec(c: &mut Criterion) {
    let spec = spec();
    let codec = MessageCodec::new(Arc::clone(&spec));
    let message = file_entry(&spec);
    let bytes = codec.encode(&message).unwrap();

    let mut group = c.benchmark_group("message_codec");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode_file_list", |b| {
        b.iter(|| codec.encode(&message).unwrap())
    });
    group.bench_function("decode_file_list", |b| {
        b.iter(|| codec.decode(&bytes).unwrap())
    });

    let icon = vec![0xA5u8; 32 * 1024];
    let status = Message::new(&spec, "wired.user.set_icon")
        .unwrap()
        .with("wired.user.icon", icon)
        .unwrap();
    let status_bytes = codec.encode(&status).unwrap();
    group.throughput(Throughput::Bytes(status_bytes.len() as u64));
    group.bench_function("decode_32k_icon", |b| {
        b.iter(|| codec.decode(&status_bytes).unwrap())
    });
    group.finish();
}

fn pipeline(
    compression: Compression,
    checksum: Checksum,
    cipher: Option<SymmetricCipher>,
) -> FrameCodec {
    let mut codec = FrameCodec::default();
    codec.set_compression(compression, 6);
    codec.set_checksum(checksum);
    if let Some(kind) = cipher {
        let cipher = SessionCipher::new(kind, &[3u8; KEY_LEN], &[5u8; IV_LEN]).unwrap();
        codec.set_cipher(Arc::new(cipher));
    }
    codec
}

fn bench_frame_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_pipeline");
    let configurations = [
        ("plain", Compression::None, Checksum::None, None),
        ("sha256", Compression::None, Checksum::Sha256, None),
        (
            "deflate_aes_sha256",
            Compression::Deflate,
            Checksum::Sha256,
            Some(SymmetricCipher::Aes256Gcm),
        ),
        (
            "deflate_xchacha_sha512",
            Compression::Deflate,
            Checksum::Sha512,
            Some(SymmetricCipher::XChaCha20Poly1305),
        ),
    ];

    for &size in &[512usize, 16 * 1024] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 61) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        for (name, compression, checksum, cipher) in configurations {
            group.bench_function(format!("encode_{}_{}b", name, size), |b| {
                let mut codec = pipeline(compression, checksum, cipher);
                b.iter_batched(
                    || BytesMut::with_capacity(size + 128),
                    |mut buf| codec.encode(&payload[..], &mut buf).unwrap(),
                    BatchSize::SmallInput,
                )
            });
            group.bench_function(format!("decode_{}_{}b", name, size), |b| {
                let mut codec = pipeline(compression, checksum, cipher);
                let mut wire = BytesMut::new();
                codec.encode(&payload[..], &mut wire).unwrap();
                b.iter_batched(
                    || wire.clone(),
                    |mut buf| {
                        let frame = codec.decode(&mut buf).unwrap().unwrap();
                        assert_eq!(frame.len(), size);
                    },
                    BatchSize::SmallInput,
                )
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_message_codec, bench_frame_pipeline);
criterion_main!(benches);
