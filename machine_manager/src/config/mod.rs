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

mod chardev;
mod drive;
mod fs;

pub use chardev::{parse_console, ConsoleConfig};
pub use drive::{parse_drive, DriveConfig};
pub use fs::{parse_fs, FsDeviceConfig, MAX_TAG_LENGTH};

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{bail, Result};
use thiserror::Error;

pub const MAX_STRING_LENGTH: usize = 255;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid parameter '{0}' for '{1}'")]
    InvalidParam(String, String),
    #[error("Unable to parse '{0}' for '{1}'")]
    ConvertValueFailed(String, String),
    #[error("Field '{0}' is missing for '{1}'")]
    FieldIsMissing(&'static str, &'static str),
    #[error("String length of '{0}' exceeds {1}")]
    StringOverLong(String, usize),
}

/// Checked configs can validate their own field values.
pub trait ConfigCheck: Send {
    /// Check whether the config is healthy, returning the first violation
    /// found.
    fn check(&self) -> Result<()>;
}

/// `on|off`-style boolean accepted on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExBool(pub bool);

impl FromStr for ExBool {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "on" | "true" | "yes" => Ok(ExBool(true)),
            "off" | "false" | "no" => Ok(ExBool(false)),
            _ => Err(()),
        }
    }
}

impl From<ExBool> for bool {
    fn from(b: ExBool) -> Self {
        b.0
    }
}

/// Parser for `field=value,field=value` device arguments.
///
/// Fields are registered up front with `push()`; unknown fields in the
/// input are rejected, and values convert lazily on `get_value()`.
pub struct CmdParser {
    name: String,
    params: BTreeMap<String, Option<String>>,
}

impl CmdParser {
    pub fn new(name: &str) -> CmdParser {
        CmdParser {
            name: name.to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Register a field this parser accepts. The empty name registers the
    /// leading positional value (e.g. `id=...` shorthand).
    pub fn push(&mut self, field: &str) -> &mut CmdParser {
        self.params.insert(field.to_string(), None);
        self
    }

    /// Split and record one full device argument string.
    pub fn parse(&mut self, cmd_param: &str) -> Result<()> {
        if cmd_param.starts_with(',') || cmd_param.ends_with(',') {
            return Err(ConfigError::InvalidParam(cmd_param.to_string(), self.name.clone()).into());
        }
        for param_item in cmd_param.split(',') {
            let param = param_item.splitn(2, '=').collect::<Vec<&str>>();
            let (field, value) = match param.len() {
                1 => ("", param[0]),
                2 => (param[0], param[1]),
                _ => unreachable!(),
            };
            match self.params.get_mut(field) {
                Some(slot) => {
                    if slot.is_some() {
                        return Err(ConfigError::InvalidParam(
                            field.to_string(),
                            self.name.clone(),
                        )
                        .into());
                    }
                    *slot = Some(value.to_string());
                }
                None => {
                    return Err(ConfigError::InvalidParam(
                        field.to_string(),
                        self.name.clone(),
                    )
                    .into())
                }
            }
        }
        Ok(())
    }

    /// Fetch and convert one field value, `Ok(None)` if absent.
    pub fn get_value<T: FromStr>(&self, field: &str) -> Result<Option<T>> {
        match self.params.get(field) {
            Some(Some(value)) => value.parse::<T>().map(Some).map_err(|_| {
                ConfigError::ConvertValueFailed(value.clone(), field.to_string()).into()
            }),
            _ => Ok(None),
        }
    }
}

pub(crate) fn check_id(id: &str, device: &str) -> Result<()> {
    if id.is_empty() {
        bail!("Device id for '{}' must not be empty", device);
    }
    if id.len() > MAX_STRING_LENGTH {
        return Err(ConfigError::StringOverLong(id.to_string(), MAX_STRING_LENGTH).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_parser() {
        let mut parser = CmdParser::new("block");
        parser.push("id").push("file").push("readonly");
        parser
            .parse("id=drive0,file=/tmp/img,readonly=on")
            .unwrap();
        assert_eq!(parser.get_value::<String>("id").unwrap().unwrap(), "drive0");
        assert_eq!(
            parser.get_value::<String>("file").unwrap().unwrap(),
            "/tmp/img"
        );
        assert!(bool::from(
            parser.get_value::<ExBool>("readonly").unwrap().unwrap()
        ));
        assert!(parser.get_value::<String>("serial").unwrap().is_none());
    }

    #[test]
    fn test_cmd_parser_errors() {
        let mut parser = CmdParser::new("block");
        parser.push("id");
        assert!(parser.parse("unknown=1").is_err());
        assert!(parser.parse(",id=a").is_err());

        let mut parser = CmdParser::new("block");
        parser.push("id");
        parser.parse("id=a").unwrap();
        assert!(parser.parse("id=b").is_err());
    }

    #[test]
    fn test_exbool() {
        assert_eq!("on".parse::<ExBool>(), Ok(ExBool(true)));
        assert_eq!("false".parse::<ExBool>(), Ok(ExBool(false)));
        assert!("1".parse::<ExBool>().is_err());
    }
}
