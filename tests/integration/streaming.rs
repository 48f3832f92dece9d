use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};

use camlink_core::config::{CamlinkConfig, StreamConfig};
use camlink_services::monitor::NetworkMonitor;
use camlink_services::quality::QualityController;
use camlink_services::stream::StreamStep;
use camlink_services::{
    ChunkSender, DatagramSink, FrameStreamer, SendPolicy, StreamLoop, StreamStatus, UdpSink,
};

use crate::*;

async fn sink_to(collector: &LoopbackCollector) -> UdpSink {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    UdpSink::new(socket, collector.addr())
}

#[tokio::test]
async fn streamed_frames_reassemble_at_collector() {
    let mut collector = LoopbackCollector::bind().await;
    let sink = sink_to(&collector).await;

    let frames = vec![
        test_frame(1, 20_000),
        test_frame(2, 7_001),
        test_frame(3, 768 * 4),
    ];
    let sender = ChunkSender::new(768, SendPolicy::from(&StreamConfig::default())).unwrap();
    let mut streamer = FrameStreamer::new(ScriptedCamera::new(frames.clone()), sender);

    assert!(matches!(
        streamer.stream_one_frame(&sink).await,
        StreamStep::Primed { frame_id: 0 }
    ));
    for (i, expected) in frames.iter().enumerate() {
        let StreamStep::Transmitted(report) = streamer.stream_one_frame(&sink).await else {
            panic!("frame {i} should be transmitted");
        };
        assert_eq!(report.frame_id, i as u32);
        assert_eq!(report.total_size, expected.len());
        assert_eq!(report.chunks_lost, 0);
        assert!(report.delivered());

        let frame = collector
            .next_frame(Duration::from_secs(2))
            .await
            .expect("collector should rebuild the frame");
        assert_eq!(frame.frame_id, i as u32);
        assert_eq!(frame.data, expected.to_vec());
    }
    streamer.shutdown();
}

#[tokio::test]
async fn stream_loop_waits_for_link_then_streams() {
    let mut collector = LoopbackCollector::bind().await;
    let sink: Arc<dyn DatagramSink> = Arc::new(sink_to(&collector).await);
    let config = CamlinkConfig::default();

    let camera = ScriptedCamera::new(vec![test_frame(9, 5_000), test_frame(10, 6_000)]);
    let sender = ChunkSender::new(config.stream.chunk_size, SendPolicy::from(&config.stream)).unwrap();
    let (link_tx, link_rx) = watch::channel(false);
    let (status_tx, mut status_rx) = watch::channel(StreamStatus::default());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let task = tokio::spawn(
        StreamLoop::new(
            FrameStreamer::new(camera, sender),
            sink,
            QualityController::new(&config.quality),
            NetworkMonitor::new(&config.monitor),
            Duration::from_millis(10),
            link_rx,
            status_tx,
            shutdown_rx,
        )
        .run(),
    );

    status_rx.wait_for(|s| s.skipped_ticks >= 3).await.unwrap();
    assert_eq!(status_rx.borrow().frames_captured, 0);

    link_tx.send(true).unwrap();
    let first = collector
        .next_frame(Duration::from_secs(2))
        .await
        .expect("stream should start once the link is up");
    assert_eq!(first.frame_id, 0);
    assert_eq!(first.data, test_frame(9, 5_000).to_vec());

    status_rx.wait_for(|s| s.frames_transmitted >= 3).await.unwrap();
    let status = status_rx.borrow().clone();
    assert!(status.link_up);
    assert_eq!(status.frames_delivered, status.frames_transmitted);
    assert!((config.quality.min..=config.quality.initial).contains(&status.quality));
    assert!(status.last_frame.is_some());

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
