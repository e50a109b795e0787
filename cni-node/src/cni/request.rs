use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CNI_COMMAND: &str = "CNI_COMMAND";
pub const CNI_CONTAINERID: &str = "CNI_CONTAINERID";
pub const CNI_NETNS: &str = "CNI_NETNS";
pub const CNI_IFNAME: &str = "CNI_IFNAME";
pub const CNI_ARGS: &str = "CNI_ARGS";

pub const K8S_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
pub const K8S_POD_NAME: &str = "K8S_POD_NAME";
pub const K8S_POD_UID: &str = "K8S_POD_UID";

const DEFAULT_IFNAME: &str = "eth0";

/// Validation failures. Every message starts with a fixed prefix that the
/// runtime side matches on, so the wording must not change.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid CNI request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected or missing CNI_COMMAND")]
    Command,

    #[error("missing CNI_CONTAINERID")]
    ContainerId,

    #[error("missing CNI_NETNS")]
    NetNs,

    #[error("missing CNI_ARGS")]
    MissingArgs,

    #[error("missing CNI_ARGS: invalid CNI_ARG '{0}'")]
    InvalidArg(String),

    #[error("missing CNI_ARGS: {0} not set")]
    MissingArgKey(&'static str),
}

/// Body posted by the shim on the runtime side.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "Env", default)]
    pub env: HashMap<String, String>,

    #[serde(
        rename = "Config",
        default,
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub config: Vec<u8>,
}

impl Request {
    pub fn from_slice(body: &[u8]) -> Result<Self, RequestError> {
        Ok(serde_json::from_slice(body)?)
    }
}

fn serialize_base64<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .encode(value)
        .serialize(serializer)
}

fn deserialize_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    use base64::Engine;
    let buf = Option::<String>::deserialize(deserializer)?;
    let Some(buf) = buf else {
        return Ok(vec![]);
    };
    base64::engine::general_purpose::STANDARD
        .decode(buf)
        .map_err(|e| serde::de::Error::custom(e.to_string()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Add,
    Delete,
    Update,
    Check,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Delete => "DEL",
            Command::Update => "UPDATE",
            Command::Check => "CHECK",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cmd = match s {
            "ADD" => Command::Add,
            "DEL" => Command::Delete,
            "UPDATE" => Command::Update,
            "CHECK" => Command::Check,
            _ => return Err(RequestError::Command),
        };
        Ok(cmd)
    }
}

/// A validated pod network lifecycle request.
#[derive(Clone, Debug, PartialEq)]
pub struct PodRequest {
    pub command: Command,
    pub container_id: String,
    /// Always set unless `command` is [`Command::Delete`].
    pub netns: Option<String>,
    pub ifname: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub pod_uid: Option<String>,
    pub raw_config: Vec<u8>,
}

impl TryFrom<Request> for PodRequest {
    type Error = RequestError;

    fn try_from(req: Request) -> Result<Self, Self::Error> {
        let Request { mut env, config } = req;

        let command: Command = env
            .get(CNI_COMMAND)
            .ok_or(RequestError::Command)?
            .parse()?;

        let container_id = non_empty(&mut env, CNI_CONTAINERID).ok_or(RequestError::ContainerId)?;

        let netns = non_empty(&mut env, CNI_NETNS);
        if netns.is_none() && command != Command::Delete {
            return Err(RequestError::NetNs);
        }

        let args = env.get(CNI_ARGS).ok_or(RequestError::MissingArgs)?;
        let mut args = parse_cni_args(args)?;
        let pod_namespace = args
            .remove(K8S_POD_NAMESPACE)
            .filter(|v| !v.is_empty())
            .ok_or(RequestError::MissingArgKey(K8S_POD_NAMESPACE))?;
        let pod_name = args
            .remove(K8S_POD_NAME)
            .filter(|v| !v.is_empty())
            .ok_or(RequestError::MissingArgKey(K8S_POD_NAME))?;
        let pod_uid = args.remove(K8S_POD_UID).filter(|v| !v.is_empty());

        let ifname = non_empty(&mut env, CNI_IFNAME).unwrap_or_else(|| DEFAULT_IFNAME.into());

        Ok(PodRequest {
            command,
            container_id,
            netns,
            ifname,
            pod_namespace,
            pod_name,
            pod_uid,
            raw_config: config,
        })
    }
}

fn non_empty(env: &mut HashMap<String, String>, key: &str) -> Option<String> {
    env.remove(key).filter(|v| !v.is_empty())
}

/// Splits `K1=V1;K2=V2` into a map. Empty segments are ignored, a segment
/// without `=` rejects the whole argument string.
fn parse_cni_args(s: &str) -> Result<BTreeMap<String, String>, RequestError> {
    let mut kv = BTreeMap::new();

    for split in s.split(';') {
        if split.is_empty() {
            continue;
        }
        let Some((k, v)) = split.split_once('=') else {
            return Err(RequestError::InvalidArg(split.to_owned()));
        };
        kv.insert(k.trim().to_owned(), v.trim().to_owned());
    }

    Ok(kv)
}
