mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use packet_bbs_radio::{
    DeliveryMode, DisconnectReason, EtherConfig, LinkConfig, LinkEngine, SimulatedEther,
};

use common::{bbs, channel, link_config, mail_app, user, CHANNEL};

#[tokio::test(start_paused = true)]
async fn test_user_reaches_mail_over_the_air() {
    let ether = SimulatedEther::new(EtherConfig::default());

    let server = LinkEngine::new();
    let (server_app, mut server_rx) = mail_app();
    server.applications().register_default(server_app).await;
    server
        .add_channel(channel(bbs(), link_config()), ether.transport("bbs"))
        .await
        .unwrap();

    let client = LinkEngine::new();
    let (client_app, mut client_rx) = mail_app();
    client.applications().register_default(client_app).await;
    client
        .add_channel(channel(user(), link_config()), ether.transport("user"))
        .await
        .unwrap();

    let vhf = CHANNEL.into();
    let session = client.connect(&vhf, user(), bbs()).await.unwrap();
    session.wait_connected().await.unwrap();

    client
        .push(&vhf, user(), bbs(), Bytes::from_static(b"mail"), DeliveryMode::RequiresAck)
        .await
        .unwrap();
    assert_eq!(&server_rx.recv().await.unwrap()[..], b"mail");
    assert_eq!(&client_rx.recv().await.unwrap()[..], b"Launching Mail\r\nmail> ");

    let remote = server.session(&vhf, bbs(), user()).await.unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.wait_closed().await, DisconnectReason::Local);
    assert_eq!(remote.wait_closed().await, DisconnectReason::Remote);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lossy_channel_delivers_in_order_exactly_once() {
    let ether = SimulatedEther::new(EtherConfig {
        packet_loss: 0.2,
        latency: Duration::from_millis(200),
    });
    let link = LinkConfig {
        max_delivery_attempts: 30,
        delivery_retry_time: Duration::from_secs(5),
        ..link_config()
    };

    let server = LinkEngine::new();
    let (server_app, mut received) = mail_app();
    server.applications().register_default(server_app).await;
    server
        .add_channel(channel(bbs(), link.clone()), ether.transport("bbs"))
        .await
        .unwrap();

    let client = LinkEngine::new();
    client
        .add_channel(channel(user(), link), ether.transport("user"))
        .await
        .unwrap();

    let vhf = CHANNEL.into();
    let session = client.connect(&vhf, user(), bbs()).await.unwrap();
    session.wait_connected().await.unwrap();

    let messages: Vec<String> = (0..12).map(|i| format!("bulletin {}", i)).collect();
    for m in &messages {
        session.send(Bytes::from(m.clone())).await.unwrap();
    }

    let mut got = Vec::new();
    while got.len() < messages.len() {
        let payload = timeout(Duration::from_secs(3600), received.recv())
            .await
            .expect("delivery stalled")
            .unwrap();
        got.push(String::from_utf8(payload.to_vec()).unwrap());
    }
    assert_eq!(got, messages);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(received.try_recv().is_err());
    let stats = ether.stats().await;
    assert!(stats.writes >= stats.delivered);

    client.shutdown().await;
    server.shutdown().await;
}
