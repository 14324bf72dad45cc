//! End-to-end: device frames over TCP reach the sink, websocket subscribers
//! and the task monitor.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use fleetwire::frame::{FrameCategory, FrameHeader, HEADER_LEN, VehicleStateFrame};
use fleetwire::{
    NoDirectory, Pipeline, PipelineConfig, Point, Position2D, TaskInfo, TimeSeriesSink,
};

#[derive(Default)]
struct CollectingSink {
    points: Mutex<Vec<Point>>,
}

#[async_trait::async_trait]
impl TimeSeriesSink for CollectingSink {
    async fn write_point(&self, point: Point) -> fleetwire::Result<()> {
        self.points.lock().push(point);
        Ok(())
    }
}

fn state_frame(vehicle_id: &[u8; 8], position: Position2D) -> Vec<u8> {
    let (lon, lat) = position.to_fixed();
    let frame = VehicleStateFrame {
        vehicle_id: *vehicle_id,
        message_id: [0; 8],
        timestamp_gnss: 1_700_000_000_000,
        velocity_gnss: 500,
        lon,
        lat,
        elevation: 0,
        heading: 1_800_000,
        tap_pos: 0,
        steering_angle: 0,
        velocity_bus: 500,
        acc_lon: 0,
        acc_lat: 0,
        acc_vert: 0,
        yaw_rate: 0,
        accel_pos: 0,
        engine_speed: 0,
        engine_torque: 0,
        brake_flag: 0,
        brake_pos: 0,
        brake_pressure: 0,
        fuel_consumption: 0,
        drive_mode: 1,
        dest_lon: 0,
        dest_lat: 0,
        pass_points: Vec::new(),
    };
    let payload = frame.encode();
    let header = FrameHeader {
        payload_len: payload.len() as u32,
        category: FrameCategory::VehicleState,
        version: 1,
        timestamp_ms: 1_700_000_000_000,
        control: 0,
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(&payload);
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_frames_flow_to_every_consumer() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = PipelineConfig::default();
    config.frame.listen_addr = "127.0.0.1:0".to_string();
    config.hub.listen_addr = Some("127.0.0.1:0".to_string());
    config.batcher.batch_size = 1;

    let sink = Arc::new(CollectingSink::default());
    let pipeline = Pipeline::start(config, sink.clone(), Arc::new(NoDirectory)).await?;
    let frame_addr = pipeline.spawn_frame_server().await?;
    let hub_addr = pipeline.subscriber_addr().expect("subscriber listener configured");

    let pickup = Position2D::new(116.3975, 39.9087);
    pipeline.monitor().register(
        TaskInfo::new("task-1", "order-1", pickup, Position2D::new(116.5, 40.0))
            .with_vehicle("V001"),
    );

    let (mut live, _) = tokio_tungstenite::connect_async(format!("ws://{hub_addr}/live")).await?;
    let (mut orders, _) =
        tokio_tungstenite::connect_async(format!("ws://{hub_addr}/events?service=orders")).await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.hub().group_size("orders") < 1 || pipeline.hub().client_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let mut device = TcpStream::connect(frame_addr).await?;
    let heartbeat = FrameHeader {
        payload_len: 0,
        category: FrameCategory::HeartbeatRequest,
        version: 1,
        timestamp_ms: 1,
        control: 0,
    };
    device.write_all(&heartbeat.encode()).await?;
    let mut response = [0u8; HEADER_LEN];
    tokio::time::timeout(Duration::from_secs(5), device.read_exact(&mut response)).await??;
    let response = FrameHeader::parse(&response)?;
    assert_eq!(response.category, FrameCategory::HeartbeatResponse);
    assert_eq!(response.payload_len, 0);

    device.write_all(&state_frame(b"V001\0\0\0\0", pickup)).await?;

    let live_payload = next_json(&mut live, |v| v.is_object()).await?;
    assert_eq!(live_payload["vehicleId"], "V001");
    assert!((live_payload["speed"].as_f64().unwrap_or_default() - 18.0).abs() < 1e-9);

    let event = next_json(&mut orders, |v| v["type"].is_string()).await?;
    assert_eq!(event["type"], "arrived_pickup");
    assert_eq!(event["taskId"], "task-1");
    assert_eq!(event["orderId"], "order-1");

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.points.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(sink.points.lock()[0].tags["vehicleId"], "V001");
    assert!(pipeline.online().is_online("V001", Duration::from_secs(60)));

    drop(device);
    pipeline.shutdown().await;
    assert_eq!(pipeline.batcher().stats().records_written, 1);
    Ok(())
}

async fn next_json<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    accept: impl Fn(&serde_json::Value) -> bool,
) -> anyhow::Result<serde_json::Value>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscriber stream ended"))??;
        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(text.as_str())?;
            if accept(&value) {
                return Ok(value);
            }
        }
    }
}
