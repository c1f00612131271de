//! AT command builders and response parsers for the serial observer module.
//!
//! Every command is `AT+<verb>\r\n` except the command-mode sentinel, which the
//! firmware expects bare. Observation reports arrive in the tagged firmware
//! format:
//!
//! ```text
//! +OBSERVER:1,<mfr: 4 hex>,<addr: 8 hex>,<adv: 4 hex>,<rssi>
//! ```
//!
//! Older firmware emitted the raw advertisement payload instead and required
//! scanning for the `FF` manufacturer block. That format is not supported.

const COMMAND_PREFIX: &str = "AT";
const COMMAND_SUFFIX: &str = "\r\n";
const COMMAND_MODE: &str = "+++";

/// Role the init sequence puts the module in.
pub const SINGLE_ROLE: &str = "1";

const RESTART: &str = "RESTART";
const SET_ROLE: &str = "ROLE=1";
const GET_ROLE: &str = "ROLE?";
const START_OBSERVER: &str = "OBSERVER=1,4,,,";
const STOP_OBSERVER: &str = "OBSERVER=0";

const OBSERVER_TAG: &str = "+OBSERVER:1,";

/// Threshold used when a scan is started without one.
pub const DEFAULT_THRESHOLD: &str = "-50";

fn command(verb: &str) -> String {
    format!("{COMMAND_PREFIX}+{verb}{COMMAND_SUFFIX}")
}

/// Switches the module into command mode. Sent without a line terminator.
pub fn build_enter_command_mode() -> &'static str {
    COMMAND_MODE
}

pub fn build_restart() -> String {
    command(RESTART)
}

/// Puts the module into the single central role.
pub fn build_set_single_role() -> String {
    command(SET_ROLE)
}

pub fn build_query_role() -> String {
    command(GET_ROLE)
}

/// Starts observer mode filtered at `threshold` dBm.
pub fn build_start_observer(threshold: &str) -> String {
    let threshold = match threshold.trim() {
        "" => DEFAULT_THRESHOLD,
        t => t,
    };
    command(&format!("{START_OBSERVER}{threshold}"))
}

pub fn build_stop_observer() -> String {
    command(STOP_OBSERVER)
}

/// Returns whatever follows the first `=`, or the input unchanged.
pub fn parse_role_query_response(line: &str) -> &str {
    match line.split_once('=') {
        Some((_, role)) if !role.is_empty() => role,
        _ => line,
    }
}

/// A single broadcast observation reported by the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverReport {
    /// Company identifier, four upper-case hex digits.
    pub manufacturer_code: String,
    pub address: String,
    pub rssi: i32,
}

impl ObserverReport {
    /// Key used to suppress repeat sightings within one reporting session.
    pub fn dedup_key(&self) -> String {
        format!("{}_{}_{}", self.manufacturer_code, self.address, self.rssi)
    }
}

fn is_hex_field(field: &str, len: usize) -> bool {
    field.len() == len && field.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Leading `-?\d+` of `field`, ignoring anything after it.
fn leading_integer(field: &str) -> Option<i32> {
    let digits_start = usize::from(field.starts_with('-'));
    let digits = field[digits_start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    field[..digits_start + digits].parse().ok()
}

/// Extracts an observation from `line`. `None` means the line is something else
/// (command echo, `OK`, boot banner, ...), which is the common case.
pub fn parse_advertisement_frame(line: &str) -> Option<ObserverReport> {
    let start = line.find(OBSERVER_TAG)? + OBSERVER_TAG.len();
    let mut fields = line[start..].splitn(4, ',');

    let manufacturer = fields.next()?;
    let address = fields.next()?;
    let advertisement = fields.next()?;
    let rssi = fields.next()?;

    if !is_hex_field(manufacturer, 4) || !is_hex_field(address, 8) || !is_hex_field(advertisement, 4)
    {
        return None;
    }

    Some(ObserverReport {
        manufacturer_code: manufacturer.to_ascii_uppercase(),
        address: address.to_string(),
        rssi: leading_integer(rssi)?,
    })
}

#[cfg(test)]
pub(crate) fn format_observer_report(
    manufacturer_code: &str,
    address: &str,
    advertisement: &str,
    rssi: i32,
) -> String {
    format!("{OBSERVER_TAG}{manufacturer_code},{address},{advertisement},{rssi}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_strings() {
        assert_eq!(build_enter_command_mode(), "+++");
        assert_eq!(build_restart(), "AT+RESTART\r\n");
        assert_eq!(build_set_single_role(), "AT+ROLE=1\r\n");
        assert_eq!(build_query_role(), "AT+ROLE?\r\n");
        assert_eq!(
            parse_role_query_response("+ROLE=1"),
            SINGLE_ROLE,
            "the role set during init is the one a query reports"
        );
        assert_eq!(build_stop_observer(), "AT+OBSERVER=0\r\n");
        assert_eq!(build_start_observer("-70"), "AT+OBSERVER=1,4,,,-70\r\n");
    }

    #[test]
    fn test_start_observer_default_threshold() {
        assert_eq!(build_start_observer(""), "AT+OBSERVER=1,4,,,-50\r\n");
        assert_eq!(build_start_observer("  "), "AT+OBSERVER=1,4,,,-50\r\n");
    }

    #[test]
    fn test_parse_role_query_response() {
        assert_eq!(parse_role_query_response("+ROLE=1"), "1");
        assert_eq!(parse_role_query_response("+ROLE=1=2"), "1=2");
        assert_eq!(parse_role_query_response("OK"), "OK");
        assert_eq!(parse_role_query_response("+ROLE="), "+ROLE=");
    }

    #[test]
    fn test_parse_fixture_recovers_fields() {
        let line = format_observer_report("004c", "A1B2C3D4", "ABCD", -45);
        let report = parse_advertisement_frame(&line).unwrap();
        assert_eq!(
            report,
            ObserverReport {
                manufacturer_code: "004C".to_string(),
                address: "A1B2C3D4".to_string(),
                rssi: -45,
            }
        );
        assert_eq!(report.dedup_key(), "004C_A1B2C3D4_-45");
    }

    #[test]
    fn test_parse_tolerates_surrounding_noise() {
        let report = parse_advertisement_frame("\r+OBSERVER:1,00E0,12345678,0000,-61\r").unwrap();
        assert_eq!(report.manufacturer_code, "00E0");
        assert_eq!(report.rssi, -61);

        let report = parse_advertisement_frame("+OBSERVER:1,0075,DEADBEEF,FFFF,7").unwrap();
        assert_eq!(report.rssi, 7);
    }

    #[test]
    fn test_parse_rejects_other_lines() {
        for line in [
            "OK",
            "",
            "+ROLE=1",
            "+OBSERVER:0,004C,12345678,ABCD,-45",
            "+OBSERVER:1,04C,12345678,ABCD,-45",
            "+OBSERVER:1,004C,1234567,ABCD,-45",
            "+OBSERVER:1,004C,12345678,ABCDE,-45",
            "+OBSERVER:1,004G,12345678,ABCD,-45",
            "+OBSERVER:1,004C,12345678,ABCD,",
            "+OBSERVER:1,004C,12345678,ABCD,-x",
            "+OBSERVER:1,004C,12345678,ABCD",
            "04,1:02011A0AFF4C0010",
        ] {
            assert_eq!(parse_advertisement_frame(line), None, "line {line:?}");
        }
    }
}
