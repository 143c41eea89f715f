//! Scripted executor for exercising provisioning logic without hosts
//!
//! Commands are answered from substring rules. Rules registered later take
//! precedence, so a test can install broad defaults and then override single
//! commands. Unmatched commands succeed with empty output.

use crate::exec::{CommandOutput, ExecError, RemoteExecutor};
use async_trait::async_trait;
use inventory::Host;
use parking_lot::Mutex;

#[derive(Clone, Debug)]
struct Rule {
    pattern: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommand {
    pub host: String,
    pub command: String,
    pub privileged: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedUpload {
    pub host: String,
    pub path: String,
    pub contents: String,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<RecordedCommand>>,
    uploads: Mutex<Vec<RecordedUpload>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command containing `pattern` with `output`
    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push_rule(pattern, output, None)
    }

    /// Answer the next command containing `pattern` with `output`
    pub fn once(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push_rule(pattern, output, Some(1))
    }

    fn push_rule(&self, pattern: &str, output: CommandOutput, remaining: Option<usize>) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            output,
            remaining,
        });
        self
    }

    pub fn recorded(&self) -> Vec<RecordedCommand> {
        self.commands.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    /// Index of the first issued command containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands
            .lock()
            .iter()
            .position(|c| c.command.contains(pattern))
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().clone()
    }

    /// Contents of the last upload whose path ends with `suffix`
    pub fn uploaded(&self, suffix: &str) -> Option<String> {
        self.uploads
            .lock()
            .iter()
            .rev()
            .find(|u| u.path.ends_with(suffix))
            .map(|u| u.contents.clone())
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        privileged: bool,
    ) -> Result<CommandOutput, ExecError> {
        self.commands.lock().push(RecordedCommand {
            host: host.name.clone(),
            command: command.to_string(),
            privileged,
        });

        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .rev()
            .find(|r| r.remaining != Some(0) && command.contains(&r.pattern));

        match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                Ok(rule.output.clone())
            }
            None => Ok(CommandOutput::ok("")),
        }
    }

    async fn upload(
        &self,
        host: &Host,
        remote_path: &str,
        contents: &str,
    ) -> Result<(), ExecError> {
        self.uploads.lock().push(RecordedUpload {
            host: host.name.clone(),
            path: remote_path.to_string(),
            contents: contents.to_string(),
        });
        Ok(())
    }
}

/// Sample outputs of the tools driven by this crate
pub mod samples {
    /// `ls -alh /sys/class/ieee80211/` with two PCI radios
    pub const RADIO_LISTING: &str = "\
total 0
drwxr-xr-x  2 root root 0 Mar  7 10:12 .
drwxr-xr-x 63 root root 0 Mar  7 10:12 ..
lrwxrwxrwx  1 root root 0 Mar  7 10:12 phy0 -> ../../devices/pci0000:00/0000:00:1c.0/0000:02:00.0/ieee80211/phy0
lrwxrwxrwx  1 root root 0 Mar  7 10:12 phy1 -> ../../devices/pci0000:00/0000:00:1c.1/0000:03:00.0/ieee80211/phy1
";

    /// `iw dev` with one interface per radio
    pub const IW_DEV: &str = "\
phy#1
\tInterface phy1_sta
\t\tifindex 5
\t\twdev 0x100000001
\t\taddr 00:0e:8e:30:9c:2a
\t\ttype managed
phy#0
\tInterface phy0_ap
\t\tifindex 4
\t\twdev 0x1
\t\taddr 00:0e:8e:30:9c:17
\t\tssid experiment
\t\ttype AP
\t\tchannel 1 (2412 MHz), width: 20 MHz, center1: 2412 MHz
";

    pub const IW_INFO_PHY0: &str = "\
Interface phy0_ap
\tifindex 4
\twdev 0x1
\taddr 00:0e:8e:30:9c:17
\tssid experiment
\ttype AP
\twiphy 0
\tchannel 1 (2412 MHz), width: 20 MHz, center1: 2412 MHz
";

    pub const IW_INFO_PHY1: &str = "\
Interface phy1_sta
\tifindex 5
\twdev 0x100000001
\taddr 00:0e:8e:30:9c:2a
\ttype managed
\twiphy 1
";

    pub const IP_LINK_DOWN: &str = "\
4: phy0_ap: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000
    link/ether 00:0e:8e:30:9c:17 brd ff:ff:ff:ff:ff:ff
";

    pub const IP_LINK_UP: &str = "\
4: phy0_ap: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc mq state DOWN mode DORMANT group default qlen 1000
    link/ether 00:0e:8e:30:9c:17 brd ff:ff:ff:ff:ff:ff
";

    /// `iw dev phy1_sta scan` seeing two networks
    pub const SCAN: &str = "\
BSS 02:0e:8e:30:9c:17(on phy1_sta)
\tlast seen: 1234.567s [boottime]
\tTSF: 0 usec (0d, 00:00:00)
\tfreq: 2412
\tbeacon interval: 100 TUs
\tcapability: ESS Privacy ShortSlotTime (0x0411)
\tsignal: -41.00 dBm
\tlast seen: 20 ms ago
\tSSID: experiment
\tSupported rates: 1.0* 2.0* 5.5* 11.0* 6.0 9.0 12.0 18.0
\tDS Parameter set: channel 1
BSS 64:66:b3:54:2a:10(on phy1_sta) -- associated
\tfreq: 5240
\tsignal: -67.00 dBm
\tSSID: lab-uplink
";
}
