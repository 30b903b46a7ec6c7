use crate::transport::HttpMethod;

/// Field copied from the session into every request that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    DeviceId,
    Language,
    Identity,
}

impl SessionField {
    pub const fn param_name(self) -> &'static str {
        match self {
            Self::DeviceId => "imei",
            Self::Language => "language",
            Self::Identity => "uid",
        }
    }
}

/// Declarative description of one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSpec {
    /// Operation type; also the signature prefix.
    pub name: &'static str,
    pub method: HttpMethod,
    /// Key into the session's service endpoint map.
    pub service: &'static str,
    pub path: &'static str,
    pub session_fields: &'static [SessionField],
    pub required_args: &'static [&'static str],
}

macro_rules! operation {
    ($ident:ident, $name:literal, $method:ident, $service:literal, $path:literal, [$($field:ident),*], [$($arg:literal),*]) => {
        pub const $ident: OperationSpec = OperationSpec {
            name: $name,
            method: HttpMethod::$method,
            service: $service,
            path: $path,
            session_fields: &[$(SessionField::$field),*],
            required_args: &[$($arg),*],
        };
    };
}

operation!(ECHO, "echo", Post, "chat", "/api/echo", [Identity], ["payload"]);
operation!(SEND_MESSAGE, "sendmsg", Post, "chat", "/api/message/sms", [DeviceId, Identity], ["toid", "message", "clientId"]);
operation!(SEND_GROUP_MESSAGE, "sendgroupmsg", Post, "group", "/api/group/sendmsg", [DeviceId, Identity], ["grid", "message", "clientId"]);
operation!(ADD_REACTION, "addreaction", Post, "reaction", "/api/message/reaction", [DeviceId, Identity], ["msgId", "toid", "rType", "rIcon"]);
operation!(GET_USER_INFO, "getuserinfo", Get, "profile", "/api/social/friend/getprofiles", [DeviceId, Language], ["friend_pversion_map"]);
operation!(GET_GROUP_INFO, "getgroupinfo", Post, "group", "/api/group/getmg-v2", [DeviceId], ["gridVerMap"]);
operation!(FIND_USER, "finduser", Get, "friend", "/api/friend/profile/get", [DeviceId, Language], ["phone"]);
operation!(GET_DOWNLOAD_META, "getdownloadmeta", Get, "file", "/api/message/asyncfile/meta", [DeviceId], ["fileId"]);

pub const ALL: &[OperationSpec] = &[
    ECHO,
    SEND_MESSAGE,
    SEND_GROUP_MESSAGE,
    ADD_REACTION,
    GET_USER_INFO,
    GET_GROUP_INFO,
    FIND_USER,
    GET_DOWNLOAD_META,
];

pub fn find(name: &str) -> Option<&'static OperationSpec> {
    ALL.iter().find(|spec| spec.name == name)
}
