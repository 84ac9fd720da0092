//! Integration tests for the tagged KV channel.

use half::f16;

use paged_kv_sync::transfer::metadata::{MetadataMessage, RequestBatchMetadata};
use paged_kv_sync::transfer::tensor::{DType, Tensor};
use paged_kv_sync::transfer::topology::{EndpointConfig, Topology, TransportConfig};
use paged_kv_sync::transfer::{TransportChannel, TransportError};

const TAG: u32 = 24_857_323;

#[tokio::test]
async fn test_metadata_round_trip() {
    let (mut a, mut b) = TransportChannel::duplex_pair(TAG, 1 << 16);

    let batch = RequestBatchMetadata::new(
        vec![vec![5, 6, 7], vec![8]],
        vec![(0, 4), (2, 4)],
        vec![(0, 8), (0, 2)],
        vec![(0, 3), (0, 0)],
    )
    .unwrap();
    let messages = vec![
        MetadataMessage::Batch(batch),
        MetadataMessage::Batch(RequestBatchMetadata::empty()),
        MetadataMessage::Probe,
    ];

    for message in &messages {
        a.send_object(message).await.unwrap();
        let received: MetadataMessage = b.recv_object().await.unwrap();
        assert_eq!(&received, message);
    }
}

#[tokio::test]
async fn test_zero_length_header_does_not_block() {
    let (mut a, mut b) = TransportChannel::duplex_pair(TAG, 1 << 16);
    a.send(&Tensor::from_slice(vec![1], &[0i64]).unwrap())
        .await
        .unwrap();
    a.send(&Tensor::zeros(vec![0], DType::U8)).await.unwrap();
    // A tensor queued behind the empty payload must not be consumed by it.
    a.send(&Tensor::from_slice(vec![2], &[1.5f32, 2.5]).unwrap())
        .await
        .unwrap();

    let empty: Option<RequestBatchMetadata> = b.recv_object().await.unwrap();
    assert!(empty.is_none());

    let next = b.recv(&[2], DType::F32).await.unwrap();
    assert_eq!(next.to_vec::<f32>().unwrap(), vec![1.5, 2.5]);
}

#[tokio::test]
async fn test_turn_based_exchange() {
    let (mut a, mut b) = TransportChannel::duplex_pair(TAG, 1 << 20);
    let values: Vec<f16> = (0..64).map(|v| f16::from_f32(v as f32)).collect();
    let key = Tensor::from_slice(vec![4, 2, 8], &values).unwrap();

    let sender = async {
        a.send_object(&MetadataMessage::Probe).await.unwrap();
        a.send(&key).await.unwrap();
        let reply: MetadataMessage = a.recv_object().await.unwrap();
        assert_eq!(reply, MetadataMessage::Batch(RequestBatchMetadata::empty()));
    };
    let receiver = async {
        let probe: MetadataMessage = b.recv_object().await.unwrap();
        assert_eq!(probe, MetadataMessage::Probe);
        let received = b.recv(&[4, 2, 8], DType::F16).await.unwrap();
        b.send_object(&MetadataMessage::Batch(RequestBatchMetadata::empty()))
            .await
            .unwrap();
        received
    };

    let ((), received) = tokio::join!(sender, receiver);
    assert_eq!(received, key);
}

#[tokio::test]
async fn test_missing_call_is_detected() {
    let (mut a, mut b) = TransportChannel::duplex_pair(TAG, 1 << 16);
    // Sender skips the value tensor and goes straight to the filler.
    a.send(&Tensor::zeros(vec![3, 2, 4], DType::F16)).await.unwrap();
    a.send(&Tensor::zeros(vec![3, 16], DType::F16)).await.unwrap();

    b.recv(&[3, 2, 4], DType::F16).await.unwrap();
    let err = b.recv(&[3, 2, 4], DType::F16).await.unwrap_err();
    assert!(matches!(err, TransportError::ProtocolDesync(_)));
}

#[tokio::test]
async fn test_peer_hangup_is_io_error() {
    let (a, mut b) = TransportChannel::duplex_pair(TAG, 1 << 16);
    drop(a);

    let err = b.recv(&[1], DType::U8).await.unwrap_err();
    assert!(matches!(err, TransportError::Io(_)));
    assert!(err.is_fatal());
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config_for(rank: usize, ports: [u16; 2]) -> TransportConfig {
    TransportConfig {
        rank,
        send_peer: 1 - rank,
        recv_peer: 1 - rank,
        endpoints: vec![
            EndpointConfig {
                rank: 0,
                addr: format!("127.0.0.1:{}", ports[0]),
            },
            EndpointConfig {
                rank: 1,
                addr: format!("127.0.0.1:{}", ports[1]),
            },
        ],
        connect_retries: 50,
        connect_backoff_ms: 20,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_establish_over_tcp() {
    let ports = [free_port(), free_port()];
    let low = Topology::resolve(&config_for(0, ports)).unwrap();
    let high = Topology::resolve(&config_for(1, ports)).unwrap();

    let (low, high) = tokio::join!(
        TransportChannel::establish(&low),
        TransportChannel::establish(&high)
    );
    let mut low = low.unwrap();
    let mut high = high.unwrap();

    let tensor = Tensor::from_slice(vec![3], &[7i64, 8, 9]).unwrap();
    high.send(&tensor).await.unwrap();
    assert_eq!(low.recv(&[3], DType::I64).await.unwrap(), tensor);

    low.send_object(&MetadataMessage::Probe).await.unwrap();
    let probe: MetadataMessage = high.recv_object().await.unwrap();
    assert_eq!(probe, MetadataMessage::Probe);
    assert_eq!(low.tag(), TAG);
}
