use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// 客户端ID类型
///
/// 客户端 id 是主题路径的最后一段，对桥接器来说是不透明字符串。
pub type ClientId = String;

/// Broker 系统状态主题前缀（mosquitto 风格）
const SYS_CONNECTION_PREFIX: &str = "$SYS/broker/connection/";
/// Broker 系统状态主题后缀
const SYS_STATE_SUFFIX: &str = "/state";

/// 桥接器入站事件
///
/// Broker 回调送来的每条消息都先被归类为这三种事件之一，
/// 再推入按 client id 串行化的处理管道。
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// 数据消息：目标客户端 id 取自主题最后一段
    Data {
        client_id: ClientId,
        topic: String,
        payload: Bytes,
    },
    /// 投递确认：客户端确认收到一条转发/重放的消息
    Ack { client_id: ClientId },
    /// 在线状态变更通知
    Liveness { client_id: ClientId, online: bool },
}

impl BridgeEvent {
    /// 事件归属的客户端 id（用于选择处理管道）
    pub fn client_id(&self) -> &str {
        match self {
            BridgeEvent::Data { client_id, .. } => client_id,
            BridgeEvent::Ack { client_id } => client_id,
            BridgeEvent::Liveness { client_id, .. } => client_id,
        }
    }
}

/// 主题地址方案
///
/// 所有的主题字符串解析都集中在这里，解析结果是结构化事件，
/// 其余模块不直接操作主题字符串。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicScheme {
    /// 数据主题命名空间（`<data>/<client-id>`）
    pub data_namespace: String,
    /// 确认主题命名空间（`<ack>/<client-id>`）
    pub ack_namespace: String,
    /// 在线状态主题命名空间（`<liveness>/online|offline/<client-id>`）
    pub liveness_namespace: String,
    /// 重放子主题：转发与重放流量发布在
    /// `<data>/<replay>/<client-id>` 上，归类时被忽略以避免自环
    pub replay_subtopic: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            data_namespace: "sensor".to_string(),
            ack_namespace: "ack".to_string(),
            liveness_namespace: "liveness".to_string(),
            replay_subtopic: "replay".to_string(),
        }
    }
}

impl TopicScheme {
    /// 桥接器需要订阅的主题过滤器
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/#", self.data_namespace),
            format!("{}/#", self.ack_namespace),
            format!("{}/#", self.liveness_namespace),
            format!("{}#", SYS_CONNECTION_PREFIX),
        ]
    }

    /// 投递主题：转发与重放都发布在这里
    pub fn delivery_topic(&self, client_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.data_namespace, self.replay_subtopic, client_id
        )
    }

    /// 确认主题
    pub fn ack_topic(&self, client_id: &str) -> String {
        format!("{}/{}", self.ack_namespace, client_id)
    }

    /// 归类一条入站消息
    ///
    /// - `Ok(Some(event))`：事件进入处理管道
    /// - `Ok(None)`：与桥接器无关的主题，或自己发布的重放流量，直接忽略
    /// - `Err(MalformedTopic)`：缺少 client id 段，调用方记录诊断后丢弃
    pub fn classify(&self, topic: &str, payload: &[u8]) -> Result<Option<BridgeEvent>> {
        // Broker 系统状态：$SYS/broker/connection/<client-id>/state，payload "1"/"0"
        if let Some(rest) = topic.strip_prefix(SYS_CONNECTION_PREFIX) {
            if let Some(client_id) = rest.strip_suffix(SYS_STATE_SUFFIX) {
                if client_id.is_empty() {
                    return Err(BridgeError::MalformedTopic(topic.to_string()));
                }
                let online = std::str::from_utf8(payload)
                    .map(|s| s.trim() == "1")
                    .unwrap_or(false);
                return Ok(Some(BridgeEvent::Liveness {
                    client_id: client_id.to_string(),
                    online,
                }));
            }
            // 其他 $SYS 连接子主题（如统计）不关心
            return Ok(None);
        }

        // 客户端自报的在线状态：<liveness>/online/<id> 与 <liveness>/offline/<id>
        if let Some(rest) = topic.strip_prefix(&format!("{}/", self.liveness_namespace)) {
            let (online, id_path) = if let Some(r) = rest.strip_prefix("online/") {
                (true, r)
            } else if let Some(r) = rest.strip_prefix("offline/") {
                (false, r)
            } else if rest == "online" || rest == "offline" {
                return Err(BridgeError::MalformedTopic(topic.to_string()));
            } else {
                return Ok(None);
            };
            let client_id = Self::last_segment(id_path)
                .ok_or_else(|| BridgeError::MalformedTopic(topic.to_string()))?;
            return Ok(Some(BridgeEvent::Liveness {
                client_id: client_id.to_string(),
                online,
            }));
        }

        // 投递确认：<ack>/<client-id>
        if let Some(rest) = topic.strip_prefix(&format!("{}/", self.ack_namespace)) {
            let client_id = Self::last_segment(rest)
                .ok_or_else(|| BridgeError::MalformedTopic(topic.to_string()))?;
            return Ok(Some(BridgeEvent::Ack {
                client_id: client_id.to_string(),
            }));
        }

        if let Some(rest) = topic.strip_prefix(&format!("{}/", self.data_namespace)) {
            // 自环保护：重放子主题上的流量是桥接器自己发布的
            if rest == self.replay_subtopic
                || rest.starts_with(&format!("{}/", self.replay_subtopic))
            {
                return Ok(None);
            }
            // 数据消息：client id 取最后一段
            let client_id = Self::last_segment(rest)
                .ok_or_else(|| BridgeError::MalformedTopic(topic.to_string()))?;
            return Ok(Some(BridgeEvent::Data {
                client_id: client_id.to_string(),
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
            }));
        }

        Ok(None)
    }

    /// 主题路径的最后一段（空段视为缺失）
    fn last_segment(path: &str) -> Option<&str> {
        path.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> TopicScheme {
        TopicScheme::default()
    }

    #[test]
    fn test_classify_data_message() {
        let event = scheme().classify("sensor/sensor-7", b"22.5").unwrap();
        match event {
            Some(BridgeEvent::Data {
                client_id,
                topic,
                payload,
            }) => {
                assert_eq!(client_id, "sensor-7");
                assert_eq!(topic, "sensor/sensor-7");
                assert_eq!(payload.as_ref(), b"22.5");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_classify_nested_data_topic() {
        // 多级路径也取最后一段作为 client id
        let event = scheme().classify("sensor/room1/light", b"on").unwrap();
        match event {
            Some(BridgeEvent::Data { client_id, .. }) => assert_eq!(client_id, "light"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_data_topic_is_rejected() {
        let err = scheme().classify("sensor/", b"22.5").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedTopic(_)));
    }

    #[test]
    fn test_replay_traffic_is_ignored() {
        // 桥接器自己发布的重放流量不能再次入队
        assert_eq!(
            scheme().classify("sensor/replay/sensor-7", b"22.5").unwrap(),
            None
        );
    }

    #[test]
    fn test_classify_ack() {
        let event = scheme().classify("ack/sensor-7", b"OK").unwrap();
        assert_eq!(
            event,
            Some(BridgeEvent::Ack {
                client_id: "sensor-7".to_string()
            })
        );
    }

    #[test]
    fn test_malformed_ack_topic_is_rejected() {
        let err = scheme().classify("ack/", b"OK").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedTopic(_)));
    }

    #[test]
    fn test_classify_liveness_subtopics() {
        let online = scheme().classify("liveness/online/sensor-7", b"").unwrap();
        assert_eq!(
            online,
            Some(BridgeEvent::Liveness {
                client_id: "sensor-7".to_string(),
                online: true,
            })
        );

        let offline = scheme().classify("liveness/offline/sensor-7", b"").unwrap();
        assert_eq!(
            offline,
            Some(BridgeEvent::Liveness {
                client_id: "sensor-7".to_string(),
                online: false,
            })
        );
    }

    #[test]
    fn test_liveness_topic_without_id_is_rejected() {
        let err = scheme().classify("liveness/online/", b"").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedTopic(_)));

        let err = scheme().classify("liveness/online", b"").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedTopic(_)));
    }

    #[test]
    fn test_classify_sys_connection_state() {
        let up = scheme()
            .classify("$SYS/broker/connection/MeshBroker2/state", b"1")
            .unwrap();
        assert_eq!(
            up,
            Some(BridgeEvent::Liveness {
                client_id: "MeshBroker2".to_string(),
                online: true,
            })
        );

        let down = scheme()
            .classify("$SYS/broker/connection/MeshBroker2/state", b"0")
            .unwrap();
        assert_eq!(
            down,
            Some(BridgeEvent::Liveness {
                client_id: "MeshBroker2".to_string(),
                online: false,
            })
        );
    }

    #[test]
    fn test_unrelated_topics_are_ignored() {
        assert_eq!(scheme().classify("weather/today", b"rain").unwrap(), None);
        assert_eq!(
            scheme().classify("$SYS/broker/uptime", b"100").unwrap(),
            None
        );
    }

    #[test]
    fn test_topic_builders() {
        let s = scheme();
        assert_eq!(s.delivery_topic("sensor-7"), "sensor/replay/sensor-7");
        assert_eq!(s.ack_topic("sensor-7"), "ack/sensor-7");
        assert_eq!(
            s.subscriptions(),
            vec![
                "sensor/#",
                "ack/#",
                "liveness/#",
                "$SYS/broker/connection/#"
            ]
        );
    }
}
