use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// gossip 操作类型，对应 topic 的最后一级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Move,
    Delete,
    Sync,
}

impl Op {
    pub const ALL: [Op; 4] = [Op::Create, Op::Move, Op::Delete, Op::Sync];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s).ok_or_else(|| anyhow!("未知的操作: {s}"))
    }
}

/// 消息中引用的一张人脸，图片和特征需要到对方的静态文件服务下载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRef {
    pub face_key: String,
    /// 图片 URL
    pub image: String,
    /// 特征 URL
    pub vector: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// 新增用户的人脸
    Create { user_id: String, faces: Vec<FaceRef> },
    /// 删除 src 用户后以 dest 用户名重新创建
    Move { src_user_id: String, dest_user_id: String, faces: Vec<FaceRef> },
    /// 删除用户
    Delete { user_id: String },
    /// 删除用户后重新创建，用于全量同步
    Sync { user_id: String, faces: Vec<FaceRef> },
}

#[derive(Serialize, Deserialize)]
struct Payload<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize, Deserialize)]
struct UserFaces {
    user_id: String,
    #[serde(default)]
    faces: Vec<FaceRef>,
}

#[derive(Serialize, Deserialize)]
struct MoveFaces {
    src_user_id: String,
    dest_user_id: String,
    #[serde(default)]
    faces: Vec<FaceRef>,
}

#[derive(Serialize, Deserialize)]
struct User {
    user_id: String,
}

impl GossipMessage {
    pub fn op(&self) -> Op {
        match self {
            Self::Create { .. } => Op::Create,
            Self::Move { .. } => Op::Move,
            Self::Delete { .. } => Op::Delete,
            Self::Sync { .. } => Op::Sync,
        }
    }

    /// 编码为 JSON，附带发送方设备 ID
    pub fn to_payload(&self, device_id: &str) -> Result<Vec<u8>> {
        let device_id = Some(device_id.to_owned());
        let bytes = match self.clone() {
            Self::Create { user_id, faces } | Self::Sync { user_id, faces } => {
                serde_json::to_vec(&Payload { device_id, body: UserFaces { user_id, faces } })?
            }
            Self::Move { src_user_id, dest_user_id, faces } => serde_json::to_vec(&Payload {
                device_id,
                body: MoveFaces { src_user_id, dest_user_id, faces },
            })?,
            Self::Delete { user_id } => {
                serde_json::to_vec(&Payload { device_id, body: User { user_id } })?
            }
        };
        Ok(bytes)
    }

    /// 按操作类型解析 JSON，返回消息中携带的设备 ID（如果有）
    pub fn from_payload(op: Op, payload: &[u8]) -> Result<(Option<String>, Self)> {
        fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<(Option<String>, T)> {
            let p: Payload<T> = serde_json::from_slice(payload)?;
            Ok((p.device_id, p.body))
        }

        Ok(match op {
            Op::Create => {
                let (id, UserFaces { user_id, faces }) = parse(payload)?;
                (id, Self::Create { user_id, faces })
            }
            Op::Sync => {
                let (id, UserFaces { user_id, faces }) = parse(payload)?;
                (id, Self::Sync { user_id, faces })
            }
            Op::Move => {
                let (id, MoveFaces { src_user_id, dest_user_id, faces }) = parse(payload)?;
                (id, Self::Move { src_user_id, dest_user_id, faces })
            }
            Op::Delete => {
                let (id, User { user_id }) = parse(payload)?;
                (id, Self::Delete { user_id })
            }
        })
    }
}

/// gossip topic 的拼接与解析
///
/// topic 格式为 `<base>/faces/<device_id>/<op>`
#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self { base: base.trim_end_matches('/').to_owned() }
    }

    pub fn topic(&self, device_id: &str, op: Op) -> String {
        format!("{}/faces/{device_id}/{op}", self.base)
    }

    /// 订阅所有设备的所有操作
    pub fn filter(&self) -> String {
        format!("{}/faces/+/+", self.base)
    }

    /// 解析 topic，返回 (设备 ID, 操作)
    pub fn parse<'a>(&self, topic: &'a str) -> Result<(&'a str, Op)> {
        let rest = topic
            .strip_prefix(self.base.as_str())
            .and_then(|s| s.strip_prefix("/faces/"))
            .ok_or_else(|| anyhow!("无法识别的 topic: {topic}"))?;
        match rest.split('/').collect::<Vec<_>>().as_slice() {
            [device, op] if !device.is_empty() => Ok((device, op.parse()?)),
            _ => Err(anyhow!("无法识别的 topic: {topic}")),
        }
    }
}

/// 一条解析后的入站消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// 发送方设备 ID，优先取消息体中的字段，没有时取 topic 中的设备 ID
    pub origin: String,
    pub message: GossipMessage,
}

impl Envelope {
    pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Self> {
        let (device, op) = topics.parse(topic)?;
        let (device_id, message) = GossipMessage::from_payload(op, payload)?;
        Ok(Self { origin: device_id.unwrap_or_else(|| device.to_owned()), message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(key: &str) -> FaceRef {
        FaceRef {
            face_key: key.into(),
            image: format!("http://peer/static/faces/alice/{key}.jpg"),
            vector: format!("http://peer/static/faces/alice/{key}.vec"),
        }
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new("aibox/gossip/");
        assert_eq!(topics.topic("dca632010203", Op::Move), "aibox/gossip/faces/dca632010203/move");
        assert_eq!(topics.filter(), "aibox/gossip/faces/+/+");
        assert_eq!(topics.parse("aibox/gossip/faces/dev1/sync").unwrap(), ("dev1", Op::Sync));
        assert!(topics.parse("aibox/gossip/faces/dev1/rename").is_err());
        assert!(topics.parse("aibox/gossip/faces/dev1/create/extra").is_err());
        assert!(topics.parse("other/faces/dev1/create").is_err());
    }

    #[test]
    fn test_payload_wire_format() {
        let msg = GossipMessage::Move {
            src_user_id: "UNKNOWN_ab12cd34".into(),
            dest_user_id: "alice".into(),
            faces: vec![face("k1")],
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.to_payload("dev1").unwrap()).unwrap();
        assert_eq!(value["device_id"], "dev1");
        assert_eq!(value["src_user_id"], "UNKNOWN_ab12cd34");
        assert_eq!(value["dest_user_id"], "alice");
        assert_eq!(value["faces"][0]["face_key"], "k1");
        assert!(value["faces"][0]["vector"].as_str().unwrap().ends_with("k1.vec"));
    }

    #[test]
    fn test_origin_falls_back_to_topic() {
        let topics = Topics::new("aibox/gossip");
        let env = Envelope::decode(&topics, "aibox/gossip/faces/dev2/delete", br#"{"user_id":"bob"}"#)
            .unwrap();
        assert_eq!(env.origin, "dev2");
        assert_eq!(env.message, GossipMessage::Delete { user_id: "bob".into() });

        let env = Envelope::decode(
            &topics,
            "aibox/gossip/faces/dev2/delete",
            br#"{"device_id":"dev3","user_id":"bob","extra":1}"#,
        )
        .unwrap();
        assert_eq!(env.origin, "dev3");

        assert!(Envelope::decode(&topics, "aibox/gossip/faces/dev2/create", b"{}").is_err());
    }
}
