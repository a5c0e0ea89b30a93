// Copyright (c) 2022 SparrowVM Authors. All rights reserved.
//
// SparrowVM is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{check_id, CmdParser, ConfigCheck, ConfigError, ExBool, MAX_STRING_LENGTH};

/// Longest serial number a block device reports through `GET_ID`.
const MAX_SERIAL_NUM_LENGTH: usize = 20;

/// Config struct for a block backing drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveConfig {
    pub id: String,
    pub path_on_host: String,
    pub read_only: bool,
    pub direct: bool,
    pub serial_num: Option<String>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        DriveConfig {
            id: "".to_string(),
            path_on_host: "".to_string(),
            read_only: false,
            direct: true,
            serial_num: None,
        }
    }
}

impl ConfigCheck for DriveConfig {
    fn check(&self) -> Result<()> {
        check_id(&self.id, "drive")?;
        if self.path_on_host.is_empty() || self.path_on_host.len() > MAX_STRING_LENGTH {
            return Err(ConfigError::StringOverLong(
                self.path_on_host.clone(),
                MAX_STRING_LENGTH,
            )
            .into());
        }
        if let Some(serial) = &self.serial_num {
            if serial.len() > MAX_SERIAL_NUM_LENGTH {
                return Err(ConfigError::StringOverLong(
                    serial.clone(),
                    MAX_SERIAL_NUM_LENGTH,
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Parse a `-drive id=...,file=...,readonly=on` style argument.
pub fn parse_drive(drive_config: &str) -> Result<DriveConfig> {
    let mut cmd_parser = CmdParser::new("drive");
    cmd_parser
        .push("id")
        .push("file")
        .push("readonly")
        .push("direct")
        .push("serial");
    cmd_parser.parse(drive_config)?;

    let mut drive = DriveConfig::default();
    if let Some(id) = cmd_parser.get_value::<String>("id")? {
        drive.id = id;
    } else {
        return Err(ConfigError::FieldIsMissing("id", "drive").into());
    }
    if let Some(file) = cmd_parser.get_value::<String>("file")? {
        drive.path_on_host = file;
    } else {
        return Err(ConfigError::FieldIsMissing("file", "drive").into());
    }
    if let Some(read_only) = cmd_parser.get_value::<ExBool>("readonly")? {
        drive.read_only = read_only.into();
    }
    if let Some(direct) = cmd_parser.get_value::<ExBool>("direct")? {
        drive.direct = direct.into();
    }
    drive.serial_num = cmd_parser.get_value::<String>("serial")?;

    drive.check()?;
    Ok(drive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drive() {
        let drive =
            parse_drive("id=rootfs,file=/tmp/rootfs.img,readonly=off,serial=sn0001").unwrap();
        assert_eq!(drive.id, "rootfs");
        assert_eq!(drive.path_on_host, "/tmp/rootfs.img");
        assert!(!drive.read_only);
        assert!(drive.direct);
        assert_eq!(drive.serial_num.as_deref(), Some("sn0001"));
    }

    #[test]
    fn test_parse_drive_missing_fields() {
        assert!(parse_drive("file=/tmp/rootfs.img").is_err());
        assert!(parse_drive("id=rootfs").is_err());
        let long_serial = "s".repeat(21);
        assert!(parse_drive(&format!("id=a,file=/f,serial={}", long_serial)).is_err());
    }

    #[test]
    fn test_drive_json_round_trip() {
        let drive = parse_drive("id=rootfs,file=/tmp/rootfs.img,readonly=on").unwrap();
        let text = serde_json::to_string(&drive).unwrap();
        let back: DriveConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, drive.id);
        assert_eq!(back.read_only, drive.read_only);
    }
}
