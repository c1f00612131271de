/// Vendors whose sightings are reported. Anything else is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manufacturer {
    Nokia,
    Motorola,
    Apple,
    SonyEricsson,
    Samsung,
    Lg,
    Google,
}

impl Manufacturer {
    pub const ALL: [Manufacturer; 7] = [
        Manufacturer::Nokia,
        Manufacturer::Motorola,
        Manufacturer::Apple,
        Manufacturer::SonyEricsson,
        Manufacturer::Samsung,
        Manufacturer::Lg,
        Manufacturer::Google,
    ];

    /// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
    pub fn company_id(&self) -> u16 {
        match self {
            Manufacturer::Nokia => 0x0001,
            Manufacturer::Motorola => 0x0008,
            Manufacturer::Apple => 0x004C,
            Manufacturer::SonyEricsson => 0x0056,
            Manufacturer::Samsung => 0x0075,
            Manufacturer::Lg => 0x00C4,
            Manufacturer::Google => 0x00E0,
        }
    }

    /// Name published in sighting events.
    pub fn display_name(&self) -> &'static str {
        match self {
            Manufacturer::Nokia => "Nokia Mobile Phones",
            Manufacturer::Motorola => "Motorola",
            Manufacturer::Apple => "Apple, Inc.",
            Manufacturer::SonyEricsson => "Sony Ericsson Mobile Communications",
            Manufacturer::Samsung => "Samsung Electronics Co. Ltd.",
            Manufacturer::Lg => "LG Electronics",
            Manufacturer::Google => "Google",
        }
    }

    pub fn from_company_id(id: u16) -> Option<Manufacturer> {
        Manufacturer::ALL.into_iter().find(|m| m.company_id() == id)
    }

    /// Looks up a four hex digit code as reported by the module.
    pub fn from_code(code: &str) -> Option<Manufacturer> {
        if code.len() != 4 || !code.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u16::from_str_radix(code, 16)
            .ok()
            .and_then(Manufacturer::from_company_id)
    }
}
