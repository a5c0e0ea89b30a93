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

const DEFAULT_CONSOLE_COLS: u16 = 80;
const DEFAULT_CONSOLE_ROWS: u16 = 25;

/// Config struct for a virtio console.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleConfig {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            id: "".to_string(),
            cols: DEFAULT_CONSOLE_COLS,
            rows: DEFAULT_CONSOLE_ROWS,
        }
    }
}

impl ConfigCheck for ConsoleConfig {
    fn check(&self) -> Result<()> {
        check_id(&self.id, "console")?;
        if self.cols == 0 || self.rows == 0 {
            return Err(ConfigError::InvalidParam(
                format!("{}x{}", self.cols, self.rows),
                "console".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Parse a `-console id=...,cols=...,rows=...` style argument.
pub fn parse_console(console_config: &str) -> Result<ConsoleConfig> {
    let mut cmd_parser = CmdParser::new("console");
    cmd_parser.push("id").push("cols").push("rows");
    cmd_parser.parse(console_config)?;

    let mut console = ConsoleConfig::default();
    if let Some(id) = cmd_parser.get_value::<String>("id")? {
        console.id = id;
    } else {
        return Err(ConfigError::FieldIsMissing("id", "console").into());
    }
    if let Some(cols) = cmd_parser.get_value::<u16>("cols")? {
        console.cols = cols;
    }
    if let Some(rows) = cmd_parser.get_value::<u16>("rows")? {
        console.rows = rows;
    }

    console.check()?;
    Ok(console)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_console() {
        let console = parse_console("id=console0").unwrap();
        assert_eq!(console.cols, 80);
        assert_eq!(console.rows, 25);

        let console = parse_console("id=console0,cols=132,rows=43").unwrap();
        assert_eq!(console.cols, 132);
        assert_eq!(console.rows, 43);
    }

    #[test]
    fn test_parse_console_invalid() {
        assert!(parse_console("cols=80").is_err());
        assert!(parse_console("id=c0,cols=0").is_err());
        assert!(parse_console("id=c0,cols=abc").is_err());
    }
}
