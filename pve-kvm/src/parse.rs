//! Parsers for PVE property strings such as `virtio=00:11:22:AA:BB:CC,bridge=vmbr0`
//! or `local-lvm:vm-100-disk-0,size=8G`.

use regex::Regex;
use std::sync::LazyLock;

static MAC_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}$").unwrap());

static NET_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^net\d+$").unwrap());

static DISK_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:scsi|virtio|sata|ide|efidisk)\d+$").unwrap());

/// Extract the MAC address from a network device string.
///
/// The MAC may be the value of the model key (`virtio=`, `e1000=`, ...), of
/// `macaddr=`, or a bare token. Returns `None` when no token is MAC-shaped.
pub fn parse_mac(netstring: &str) -> Option<&str> {
    netstring
        .split(',')
        .map(|token| match token.split_once('=') {
            Some((_, value)) => value.trim(),
            None => token.trim(),
        })
        .find(|value| MAC_ADDRESS.is_match(value))
}

/// Return the `storage:volume-id` part of a disk string, dropping any
/// trailing `,key=value` attributes.
pub fn parse_dev(diskstring: &str) -> &str {
    match diskstring.split_once(',') {
        Some((dev, _)) => dev.trim(),
        None => diskstring.trim(),
    }
}

pub fn is_net_key(key: &str) -> bool {
    NET_KEY.is_match(key)
}

pub fn is_disk_key(key: &str) -> bool {
    DISK_KEY.is_match(key)
}
