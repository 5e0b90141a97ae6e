use super::*;

/// Outcome of a ping run from the device.
///
/// `failed` is set when the ping could not be evaluated or when the loss
/// exceeds the acceptable percentage. Counters are kept as the device
/// reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PingResult {
    pub failed: bool,
    pub msg: String,
    pub packet_loss: Option<String>,
    pub packets_sent: Option<String>,
    pub packets_received: Option<String>,
    /// Round-trip times in microseconds. Absent when every echo request was lost.
    pub rtt_minimum: Option<String>,
    pub rtt_maximum: Option<String>,
    pub rtt_average: Option<String>,
    pub rtt_stddev: Option<String>,
    pub warnings: Vec<String>,
}

/// Evaluate a `ping-results` element.
pub(super) fn evaluate_ping(results: &Element, acceptable_percent_loss: u32) -> PingResult {
    let mut outcome = PingResult {
        failed: true,
        ..Default::default()
    };
    let response = results.to_pretty();

    let (errors, warnings) = junos::ping_problems(results);
    if !errors.is_empty() {
        outcome.msg = format!("Ping returned errors: {}", errors.join(", "));
        return outcome;
    }
    outcome.warnings = warnings;

    let Some(summary) = results.child("probe-results-summary") else {
        outcome.msg = format!("Probe-results-summary not found in response: {response}");
        return outcome;
    };
    let field = |tag: &str| summary.child(tag).map(|el| el.text().trim().to_string());

    for (key, tag) in [
        ("packet_loss", "packet-loss"),
        ("packets_sent", "probes-sent"),
        ("packets_received", "responses-received"),
    ] {
        if field(tag).is_none() {
            outcome.msg = format!("Expected field {key} not found in response: {response}");
            return outcome;
        }
    }
    outcome.packet_loss = field("packet-loss");
    outcome.packets_sent = field("probes-sent");
    outcome.packets_received = field("responses-received");

    let raw_loss = outcome.packet_loss.clone().unwrap_or_default();
    let packet_loss = match raw_loss.parse::<f64>() {
        Ok(loss) => loss.round_ties_even() as i64,
        Err(_) => {
            outcome.msg = format!("Packet loss {raw_loss} not an integer. Response: {response}");
            return outcome;
        }
    };

    let rtt = [
        ("rtt_minimum", "rtt-minimum"),
        ("rtt_maximum", "rtt-maximum"),
        ("rtt_average", "rtt-average"),
        ("rtt_stddev", "rtt-stddev"),
    ];
    // Round-trip statistics exist as soon as one echo request was answered.
    if packet_loss < 100
        && let Some((key, _)) = rtt.iter().find(|(_, tag)| field(tag).is_none())
    {
        outcome.msg = format!("Expected field {key} not found in response: {response}");
        return outcome;
    }
    outcome.rtt_minimum = field("rtt-minimum");
    outcome.rtt_maximum = field("rtt-maximum");
    outcome.rtt_average = field("rtt-average");
    outcome.rtt_stddev = field("rtt-stddev");

    outcome.msg = format!(
        "Loss {}%, (Sent {} | Received {})",
        raw_loss,
        outcome.packets_sent.as_deref().unwrap_or_default(),
        outcome.packets_received.as_deref().unwrap_or_default()
    );
    outcome.failed = packet_loss > i64::from(acceptable_percent_loss);
    outcome
}

impl ConnectionManager {
    /// Ping from the device.
    ///
    /// `params` become the children of the `ping` RPC (`host`, `count`,
    /// `rapid`, ...). A ping that runs but loses more than
    /// `acceptable_percent_loss` percent of its packets is reported through
    /// [`PingResult::failed`]; only a ping that cannot be executed is an error.
    pub async fn ping(
        &mut self,
        params: &ArgMap,
        acceptable_percent_loss: u32,
    ) -> Result<PingResult, DeviceError> {
        self.open().await?;
        debug!("{} Executing ping with parameters: {:?}", self.label, params);
        let call = RpcCall {
            name: "ping".to_string(),
            kwargs: params.clone(),
            attrs: ArgMap::new(),
            format: RpcFormat::Xml,
            ignore_warning: WarningFilter::none(),
        };
        let results = match self.backend.ping(&call).await {
            Ok(results) => results,
            Err(e) => {
                let message = format!("Unable to execute ping: {e}");
                self.record(SessionEvent::RpcExecuted {
                    rpc: "ping".to_string(),
                    format: RpcFormat::Xml,
                    success: false,
                    message: message.clone(),
                });
                return Err(if e.is_disconnect() {
                    DeviceError::Connection(message)
                } else {
                    DeviceError::rpc(message)
                });
            }
        };
        debug!("{} Ping executed.", self.label);

        let outcome = evaluate_ping(&results, acceptable_percent_loss);
        self.record(SessionEvent::RpcExecuted {
            rpc: "ping".to_string(),
            format: RpcFormat::Xml,
            success: !outcome.failed,
            message: outcome.msg.clone(),
        });
        if outcome.failed {
            warn!("{} {}", self.label, outcome.msg);
        }
        Ok(outcome)
    }
}
