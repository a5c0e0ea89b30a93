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

use super::{check_id, CmdParser, ConfigCheck, ConfigError};

/// Tag bytes in the device config space, including the terminating NUL.
pub const MAX_TAG_LENGTH: usize = 36;

/// Config struct for a shared filesystem device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsDeviceConfig {
    pub id: String,
    /// Mount tag the guest uses to identify the filesystem.
    pub tag: String,
}

impl Default for FsDeviceConfig {
    fn default() -> Self {
        FsDeviceConfig {
            id: "".to_string(),
            tag: "".to_string(),
        }
    }
}

impl ConfigCheck for FsDeviceConfig {
    fn check(&self) -> Result<()> {
        check_id(&self.id, "fs")?;
        if self.tag.is_empty() {
            return Err(ConfigError::FieldIsMissing("tag", "fs").into());
        }
        // One byte is reserved for the NUL terminator.
        if self.tag.len() >= MAX_TAG_LENGTH {
            return Err(ConfigError::StringOverLong(self.tag.clone(), MAX_TAG_LENGTH - 1).into());
        }
        Ok(())
    }
}

/// Parse a `-fs id=...,tag=...` style argument.
pub fn parse_fs(fs_config: &str) -> Result<FsDeviceConfig> {
    let mut cmd_parser = CmdParser::new("fs");
    cmd_parser.push("id").push("tag");
    cmd_parser.parse(fs_config)?;

    let mut fs = FsDeviceConfig::default();
    if let Some(id) = cmd_parser.get_value::<String>("id")? {
        fs.id = id;
    } else {
        return Err(ConfigError::FieldIsMissing("id", "fs").into());
    }
    if let Some(tag) = cmd_parser.get_value::<String>("tag")? {
        fs.tag = tag;
    }

    fs.check()?;
    Ok(fs)
}
