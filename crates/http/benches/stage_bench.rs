use std::hint::black_box;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Decoder, Encoder};

use stage_http::config::ServerConfig;
use stage_http::pipeline::{Outcome, ProgressTask, Service, ServiceData, ServiceEngine, Services, Stage};
use stage_http::protocol::HttpError;
use stage_http::reader::NetworkReader;
use stage_http::server::Connection;
use stage_http::services::register_defaults;
use stage_http::source::BytesSource;
use stage_http::websocket::{Frame, FrameCodec};

// Mock IO for testing
#[derive(Clone)]
struct MockIO {
    read_data: Vec<u8>,
    read_pos: usize,
}

impl MockIO {
    fn new(read_data: Vec<u8>) -> Self {
        Self { read_data, read_pos: 0 }
    }
}

impl AsyncRead for MockIO {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let remaining = &self.read_data[self.read_pos..];
        let amt = std::cmp::min(remaining.len(), buf.remaining());
        buf.put_slice(&remaining[..amt]);
        self.read_pos += amt;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockIO {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

struct HelloWorld;

#[async_trait]
impl Service for HelloWorld {
    fn stage(&self) -> Stage {
        Stage::CreateDocument
    }

    fn can_handle(&self, _task: &ProgressTask) -> Option<ServiceData> {
        Some(ServiceData::none())
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        task.document_mut().push_source(BytesSource::text("Hello World!"));
        Ok(Outcome::Continue)
    }
}

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl/7.79.1\r\nAccept: */*\r\n\r\n";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn bench_network_reader(c: &mut Criterion) {
    c.bench_function("read_request_lines", |b| {
        b.to_async(runtime()).iter(|| async {
            let mut reader = NetworkReader::new(MockIO::new(REQUEST.to_vec()));
            while let Some(line) = reader.read_line().await.unwrap() {
                if line.is_empty() {
                    break;
                }
                black_box(line);
            }
        });
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut frame = Frame::binary(vec![7u8; 4096]);
    frame.apply_mask([1, 2, 3, 4]);
    let mut encoded = BytesMut::new();
    FrameCodec::default().encode(frame.clone(), &mut encoded).unwrap();

    c.bench_function("encode_frame", |b| {
        b.iter(|| {
            let mut dst = BytesMut::new();
            FrameCodec::default().encode(black_box(frame.clone()), &mut dst).unwrap();
            black_box(dst);
        });
    });

    c.bench_function("decode_and_unmask_frame", |b| {
        b.iter(|| {
            let mut src = encoded.clone();
            let mut frame = FrameCodec::default().decode(&mut src).unwrap().unwrap();
            frame.unapply_mask();
            black_box(frame);
        });
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let services = Services::new();
    register_defaults(&services);
    services.add(HelloWorld);
    let engine = ServiceEngine::new(Arc::new(services));
    let config = Arc::new(ServerConfig::default());
    let remote_addr = SocketAddr::from(([127, 0, 0, 1], 40000));

    c.bench_function("process_simple_request", |b| {
        b.to_async(runtime()).iter(|| async {
            let mock_io = MockIO::new(REQUEST.to_vec());
            let connection = Connection::new(1, remote_addr, mock_io.clone(), mock_io, config.read_buffer_size);
            let task = ProgressTask::new(connection, Arc::clone(&config));
            black_box(engine.execute_task_chain(task, Stage::LAST).await.unwrap());
        });
    });
}

criterion_group!(benches, bench_network_reader, bench_frame_codec, bench_pipeline);
criterion_main!(benches);
