use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use bridge::{Bridge, BridgeConfig, BridgeError, Role};
use comms::Tensor;
use env_logger::{Target, WriteStyle};
use log::LevelFilter;
use tokio::io::{duplex, split};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn bridge(role: Role) -> Bridge {
    let cfg = BridgeConfig::new(role, "127.0.0.1:0", "127.0.0.1:0")
        .with_waiting_alert_timeout(Duration::from_secs(1));
    Bridge::new(cfg)
}

#[tokio::test]
async fn slow_peer_triggers_periodic_warnings() -> Result<(), BridgeError> {
    let captured = Captured::default();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Off)
        .filter_module("bridge", LevelFilter::Warn)
        .target(Target::Pipe(Box::new(captured.clone())))
        .write_style(WriteStyle::Never)
        .init();

    let (leader_out, follower_in) = duplex(1 << 16);
    let (follower_out, leader_in) = duplex(1 << 16);
    let leader = bridge(Role::Leader);
    let follower = bridge(Role::Follower);

    let (rx, tx) = split(leader_in);
    let inbound = comms::channel(rx, tx);
    let (rx, tx) = split(leader_out);
    leader.attach(inbound, comms::channel(rx, tx))?;

    let (rx, tx) = split(follower_in);
    let inbound = comms::channel(rx, tx);
    let (rx, tx) = split(follower_out);
    follower.attach(inbound, comms::channel(rx, tx))?;

    let slow_leader = async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        leader.start(0).await?;
        leader.send_current("late", Tensor::vector(vec![1.0])).await?;
        leader.commit().await
    };

    let ((), late) = tokio::try_join!(slow_leader, follower.receive(0, "late"))?;
    assert_eq!(late.values(), &[1.0]);

    let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    let alerts = out
        .matches("waiting to receive iter_id: 0, name: late timeout")
        .count();
    assert!(alerts >= 2, "expected two alerts, got:\n{out}");

    tokio::try_join!(leader.terminate(), follower.terminate())?;
    Ok(())
}
