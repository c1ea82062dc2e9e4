use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use log::debug;

const SYS_NET: &str = "/sys/class/net";

/// 设备 ID，用于区分 gossip topic 以及过滤自己发出的消息
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// 使用指定的字符串作为设备 ID
    ///
    /// 设备 ID 会出现在 MQTT topic 中，因此不能包含 `/`、`+`、`#`
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains(['/', '+', '#']) {
            return Err(anyhow!("无效的设备 ID: {id:?}"));
        }
        Ok(Self(id))
    }

    /// 读取本机第一块物理网卡的 MAC 地址作为设备 ID
    ///
    /// 回环和 docker0、br-* 等虚拟网卡没有 `device` 链接，它们的 MAC 地址可能在重启后变化
    pub fn detect() -> Result<Self> {
        Self::detect_in(Path::new(SYS_NET))
    }

    fn detect_in(sys_net: &Path) -> Result<Self> {
        let mut ifaces = fs::read_dir(sys_net)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        ifaces.sort();

        for iface in ifaces {
            if !iface.join("device").exists() {
                continue;
            }
            let Ok(addr) = fs::read_to_string(iface.join("address")) else {
                continue;
            };
            let mac = addr.trim().replace(':', "").to_ascii_lowercase();
            if mac.len() == 12 && mac.chars().any(|c| c != '0') {
                debug!("使用网卡 {} 的 MAC 地址作为设备 ID", iface.display());
                return Self::new(mac);
            }
        }
        Err(anyhow!("找不到可用的网卡 MAC 地址，请手动指定设备 ID"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
