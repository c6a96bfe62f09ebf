//! WiFi bring-up and teardown.
//!
//! One station connection per wake cycle. Everything is bounded: an
//! unreachable access point surfaces as fetch failures, which the decision
//! engine already knows how to pace, so nothing here may loop forever.

use embassy_net::Stack;
use embassy_time::{Duration, Timer};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use log::{debug, info, warn};

/// Association attempts before giving the cycle up as offline.
const CONNECT_ATTEMPTS: u8 = 3;

/// Start the station and associate. Returns false if the access point could
/// not be joined within the attempt budget.
pub async fn connect(controller: &mut WifiController<'static>, ssid: &str, password: &str) -> bool {
    if !matches!(controller.is_started(), Ok(true)) {
        let client_config = ModeConfig::Client(
            ClientConfig::default()
                .with_ssid(ssid.into())
                .with_password(password.into()),
        );
        if let Err(err) = controller.set_config(&client_config) {
            warn!("wifi config rejected: {err:?}");
            return false;
        }
        if let Err(err) = controller.start_async().await {
            warn!("wifi start failed: {err:?}");
            return false;
        }
    }

    for attempt in 1..=CONNECT_ATTEMPTS {
        match controller.connect_async().await {
            Ok(()) => {
                info!("wifi connected to {ssid}");
                return true;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{CONNECT_ATTEMPTS} failed: {err:?}");
                Timer::after(Duration::from_secs(2)).await;
            }
        }
    }
    false
}

/// Wait for link-up and a DHCP lease, up to `timeout_secs`. The caller must
/// keep the network runner polled concurrently.
pub async fn wait_for_ip(stack: Stack<'static>, timeout_secs: u32) -> bool {
    for _ in 0..timeout_secs * 2 {
        if stack.is_link_up() {
            if let Some(config) = stack.config_v4() {
                info!("got ip {}", config.address);
                return true;
            }
        }
        Timer::after(Duration::from_millis(500)).await;
    }
    warn!("no dhcp lease after {timeout_secs}s");
    false
}

/// Drop the association and power the radio down before deep sleep.
pub async fn disconnect(controller: &mut WifiController<'static>) {
    if let Err(err) = controller.disconnect_async().await {
        debug!("wifi disconnect (may already be down): {err:?}");
    }
    if let Err(err) = controller.stop_async().await {
        debug!("wifi stop: {err:?}");
    }
    info!("wifi stopped");
}
