use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::LogEntry;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("log entry has no `jsonPayload` object")]
    MissingPayload,

    #[error("log entry has an empty `jsonPayload`")]
    EmptyPayload,

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("required field `{field}` has an unusable value: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reporter {
    Src,
    Dest,
}

impl Reporter {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SRC" => Some(Self::Src),
            "DEST" => Some(Self::Dest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Src => "SRC",
            Self::Dest => "DEST",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub src_ip: String,
    pub dest_ip: String,
    pub src_port: u16,
    pub dest_port: u16,
    /// Raw IANA protocol number.
    pub protocol: u8,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instance {
    pub vm_name: Option<String>,
    pub project_id: Option<String>,
    pub zone: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vpc {
    pub vpc_name: Option<String>,
    pub subnetwork_name: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GkeDetails {
    pub cluster_name: Option<String>,
    pub cluster_location: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Location {
    pub continent: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u64>,
}

/// A single VPC flow-log entry, flattened out of its `LogEntry`.
///
/// Connection and counters are always populated; everything else is only
/// set when the exporter attached it (instance details are absent for
/// internet endpoints, geolocation is absent for internal ones).
#[derive(Debug, Clone, PartialEq)]
pub struct FlowLogRecord {
    pub connection: Connection,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub rtt_msec: Option<u64>,
    pub reporter: Option<Reporter>,
    pub src_instance: Option<Instance>,
    pub dest_instance: Option<Instance>,
    pub src_vpc: Option<Vpc>,
    pub dest_vpc: Option<Vpc>,
    pub src_gke: Option<GkeDetails>,
    pub dest_gke: Option<GkeDetails>,
    pub src_location: Option<Location>,
    pub dest_location: Option<Location>,
    /// `timestamp` of the enclosing `LogEntry`.
    pub timestamp: Option<String>,
    /// The `jsonPayload` exactly as decoded.
    pub raw: Map<String, Value>,
}

impl FlowLogRecord {
    pub fn from_log_entry(entry: &LogEntry) -> Result<Self, ExtractError> {
        let payload = match entry.get("jsonPayload") {
            Some(Value::Object(payload)) if payload.is_empty() => {
                return Err(ExtractError::EmptyPayload);
            }
            Some(Value::Object(payload)) => payload,
            _ => return Err(ExtractError::MissingPayload),
        };
        let fields = Fields(payload);

        let connection = Connection {
            src_ip: fields.required_str("connection.src_ip")?,
            dest_ip: fields.required_str("connection.dest_ip")?,
            src_port: fields.required_num("connection.src_port")?,
            dest_port: fields.required_num("connection.dest_port")?,
            protocol: fields.required_num("connection.protocol")?,
        };

        Ok(Self {
            connection,
            bytes_sent: fields.required_num("bytes_sent")?,
            packets_sent: fields.required_num("packets_sent")?,
            start_time: fields.str("start_time"),
            end_time: fields.str("end_time"),
            rtt_msec: fields.num("rtt_msec"),
            reporter: fields.str("reporter").as_deref().and_then(Reporter::parse),
            src_instance: fields.instance("src_instance"),
            dest_instance: fields.instance("dest_instance"),
            src_vpc: fields.vpc("src_vpc"),
            dest_vpc: fields.vpc("dest_vpc"),
            src_gke: fields.gke("src_gke_details"),
            dest_gke: fields.gke("dest_gke_details"),
            src_location: fields.location("src_location"),
            dest_location: fields.location("dest_location"),
            timestamp: entry
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_owned),
            raw: payload.clone(),
        })
    }

    /// Hostname to map the log onto in LogicMonitor: the source VM, falling
    /// back to the destination VM.
    pub fn resource_hostname(&self) -> Option<&str> {
        [&self.src_instance, &self.dest_instance]
            .into_iter()
            .flatten()
            .find_map(|i| i.vm_name.as_deref())
    }

    /// Flat key/value view used for ingest metadata and diagnostics.
    pub fn attributes(&self) -> Map<String, Value> {
        let c = &self.connection;
        let mut attrs = Map::new();
        attrs.insert("src_ip".into(), c.src_ip.clone().into());
        attrs.insert("dest_ip".into(), c.dest_ip.clone().into());
        attrs.insert("src_port".into(), c.src_port.into());
        attrs.insert("dest_port".into(), c.dest_port.into());
        attrs.insert("protocol".into(), c.protocol.into());
        attrs.insert("bytes_sent".into(), self.bytes_sent.into());
        attrs.insert("packets_sent".into(), self.packets_sent.into());

        if let Some(reporter) = self.reporter {
            attrs.insert("reporter".into(), reporter.as_str().into());
        }
        if let Some(src) = &self.src_instance {
            insert_opt(&mut attrs, "vm_name", &src.vm_name);
            insert_opt(&mut attrs, "project_id", &src.project_id);
        }
        if let Some(vpc) = &self.src_vpc {
            insert_opt(&mut attrs, "vpc_name", &vpc.vpc_name);
            insert_opt(&mut attrs, "subnet_name", &vpc.subnetwork_name);
        }
        attrs
    }
}

impl fmt::Display for FlowLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.connection;
        write!(
            f,
            "VPC Flow: {}:{} -> {}:{} proto={} bytes={}",
            c.src_ip, c.src_port, c.dest_ip, c.dest_port, c.protocol, self.bytes_sent
        )
    }
}

fn insert_opt(attrs: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        attrs.insert(key.into(), v.clone().into());
    }
}

/// Flow-log exporters emit int64 counters as JSON strings, so every numeric
/// field goes through here regardless of how it arrived.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Null-safe dotted-path lookups over a `jsonPayload`.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn get(&self, path: &str) -> Option<&'a Value> {
        let mut parts = path.split('.');
        let first = self.0.get(parts.next()?)?;
        parts
            .try_fold(first, |v, key| v.get(key))
            .filter(|v| !v.is_null())
    }

    fn required_str(&self, path: &'static str) -> Result<String, ExtractError> {
        match self.get(path).ok_or(ExtractError::MissingField(path))? {
            Value::String(s) if !s.is_empty() => Ok(s.clone()),
            other => Err(invalid(path, other)),
        }
    }

    fn required_num<T: TryFrom<u64>>(&self, path: &'static str) -> Result<T, ExtractError> {
        let value = self.get(path).ok_or(ExtractError::MissingField(path))?;
        as_u64(value)
            .and_then(|n| T::try_from(n).ok())
            .ok_or_else(|| invalid(path, value))
    }

    fn str(&self, path: &str) -> Option<String> {
        self.get(path)?.as_str().map(str::to_owned)
    }

    fn num(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(as_u64)
    }

    fn object(&self, key: &str) -> Option<Fields<'a>> {
        self.0.get(key)?.as_object().map(Fields)
    }

    fn instance(&self, key: &str) -> Option<Instance> {
        let f = self.object(key)?;
        Some(Instance {
            vm_name: f.str("vm_name"),
            project_id: f.str("project_id"),
            zone: f.str("zone"),
            region: f.str("region"),
        })
    }

    fn vpc(&self, key: &str) -> Option<Vpc> {
        let f = self.object(key)?;
        Some(Vpc {
            vpc_name: f.str("vpc_name"),
            subnetwork_name: f.str("subnetwork_name"),
            project_id: f.str("project_id"),
        })
    }

    fn gke(&self, key: &str) -> Option<GkeDetails> {
        let f = self.object(key)?;
        Some(GkeDetails {
            cluster_name: f.str("cluster.cluster_name"),
            cluster_location: f.str("cluster.cluster_location"),
            pod_name: f.str("pod.pod_name"),
            pod_namespace: f.str("pod.pod_namespace"),
        })
    }

    fn location(&self, key: &str) -> Option<Location> {
        let f = self.object(key)?;
        Some(Location {
            continent: f.str("continent"),
            country: f.str("country"),
            region: f.str("region"),
            city: f.str("city"),
            asn: f.num("asn"),
        })
    }
}

fn invalid(field: &'static str, value: &Value) -> ExtractError {
    ExtractError::InvalidField {
        field,
        value: value.to_string(),
    }
}
