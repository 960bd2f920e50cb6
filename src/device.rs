//! Static registry of STM32 device identifiers and their flash geometry
//!
//! Device identifiers are the low 12 bits of the DBGMCU_IDCODE register, as reported by GET_ID.

use core::fmt;

use crate::protocol::EraseCommand;

/// Mask applied to a 16-bit identifier before lookup
pub const DEVICE_ID_MASK: u16 = 0x0FFF;

/// Default user flash base address
pub const FLASH_START: u32 = 0x0800_0000;

// Flash size register ("flash size data register" in the reference manuals) per family
const C0_FLASH_SIZE: u32 = 0x1FFF_75E0;
const F0_FLASH_SIZE: u32 = 0x1FFF_F7CC;
const F1_FLASH_SIZE: u32 = 0x1FFF_F7E0;
const F2_FLASH_SIZE: u32 = 0x1FFF_7A22;
const F3_FLASH_SIZE: u32 = 0x1FFF_F7CC;
const F4_FLASH_SIZE: u32 = 0x1FFF_7A22;
const F7_FLASH_SIZE: u32 = 0x1FF0_F442;
const G0_FLASH_SIZE: u32 = 0x1FFF_75E0;
const G4_FLASH_SIZE: u32 = 0x1FFF_75E0;
const H5_FLASH_SIZE: u32 = 0x1FFF_75E0;
const H7_FLASH_SIZE: u32 = 0x1FF1_E880;
const L0_FLASH_SIZE: u32 = 0x1FF8_007C;
const L1_FLASH_SIZE: u32 = 0x1FF8_004C;
const L4_FLASH_SIZE: u32 = 0x1FFF_75E0;
const L5_FLASH_SIZE: u32 = 0x0BFA_05E0;
const WB_FLASH_SIZE: u32 = 0x1FFF_75E0;

/// Silicon family
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Family {
    C0,
    F0,
    F1,
    F2,
    F3,
    F4,
    F7,
    H5,
    H7,
    L0,
    L1,
    L4,
    L5,
    G0,
    G4,
    WB,
    Unknown,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::C0 => "STM32C0",
            Family::F0 => "STM32F0",
            Family::F1 => "STM32F1",
            Family::F2 => "STM32F2",
            Family::F3 => "STM32F3",
            Family::F4 => "STM32F4",
            Family::F7 => "STM32F7",
            Family::H5 => "STM32H5",
            Family::H7 => "STM32H7",
            Family::L0 => "STM32L0",
            Family::L1 => "STM32L1",
            Family::L4 => "STM32L4",
            Family::L5 => "STM32L5",
            Family::G0 => "STM32G0",
            Family::G4 => "STM32G4",
            Family::WB => "STM32WB",
            Family::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Flash geometry and erase behaviour of a device
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeviceDescriptor {
    pub family: Family,
    /// 12-bit device identifier
    pub device_id: u16,
    pub flash_kb: u16,
    /// Address of the 16-bit little-endian flash size register
    pub flash_size_addr: u32,
    pub erase_timeout_ms: u32,
    pub erase_cmd: EraseCommand,
    pub flash_start: u32,
    /// RAM address clear of the bootloader's own working memory
    pub ram_test_addr: u32,
    pub name: &'static str,
}

impl DeviceDescriptor {
    /// Whether the global (non-extended) erase command is used
    pub fn supports_global_erase(&self) -> bool {
        self.erase_cmd == EraseCommand::Standard
    }

    /// Copy of this descriptor with a different erase command
    pub fn with_erase_cmd(self, erase_cmd: EraseCommand) -> Self {
        Self { erase_cmd, ..self }
    }
}

/// Descriptor for identifiers missing from [`DEVICES`]
pub const UNKNOWN: DeviceDescriptor = DeviceDescriptor {
    family: Family::Unknown,
    device_id: 0,
    flash_kb: 64,
    flash_size_addr: F0_FLASH_SIZE,
    erase_timeout_ms: 40000,
    erase_cmd: EraseCommand::Standard,
    flash_start: FLASH_START,
    ram_test_addr: 0x2000_0200,
    name: "STM32 Unknown",
};

#[allow(clippy::too_many_arguments)]
const fn dev(
    family: Family,
    device_id: u16,
    flash_kb: u16,
    flash_size_addr: u32,
    erase_timeout_ms: u32,
    erase_cmd: EraseCommand,
    ram_test_addr: u32,
    name: &'static str,
) -> DeviceDescriptor {
    DeviceDescriptor {
        family,
        device_id,
        flash_kb,
        flash_size_addr,
        erase_timeout_ms,
        erase_cmd,
        flash_start: FLASH_START,
        ram_test_addr,
        name,
    }
}

/// Known devices. Not all entries have been tested against hardware.
#[rustfmt::skip]
pub static DEVICES: &[DeviceDescriptor] = &[
    dev(Family::C0, 0x443, 32, C0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_1000, "STM32C011xx"),
    dev(Family::C0, 0x453, 32, C0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_1000, "STM32C031xx"),
    dev(Family::C0, 0x44C, 64, C0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_1000, "STM32C051xx"),
    dev(Family::C0, 0x493, 128, C0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_1000, "STM32C071xx"),
    dev(Family::C0, 0x44D, 256, C0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_1000, "STM32C091xx/92xx"),

    dev(Family::F0, 0x440, 64, F0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_0800, "STM32F030x8/F05xxx"),
    dev(Family::F0, 0x444, 32, F0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_0800, "STM32F03xx4/6"),
    dev(Family::F0, 0x442, 256, F0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_0800, "STM32F030xC/F09xxx"),
    dev(Family::F0, 0x445, 32, F0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_0800, "STM32F04xxx/F070x6"),
    dev(Family::F0, 0x448, 128, F0_FLASH_SIZE, 2000, EraseCommand::Standard, 0x2000_0800, "STM32F070xB/F071xx/F72xx"),

    dev(Family::F1, 0x412, 32, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F10xxx Low-density"),
    dev(Family::F1, 0x410, 128, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F10xxx Medium-density"),
    dev(Family::F1, 0x414, 512, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F10xxx High-density"),
    dev(Family::F1, 0x420, 128, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F10xxx Medium-density VL"),
    dev(Family::F1, 0x428, 512, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F10xxx High-density VL"),
    dev(Family::F1, 0x418, 256, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F105xx/F107xx"),
    dev(Family::F1, 0x430, 1024, F1_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F10xxx XL-density"),

    dev(Family::F2, 0x411, 1024, F2_FLASH_SIZE, 12000, EraseCommand::Standard, 0x2001_0000, "STM32F2xxxx"),

    dev(Family::F3, 0x432, 256, F3_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F373xx/F378xx"),
    dev(Family::F3, 0x422, 256, F3_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F302xB(C)/F303xB(C)/F358xx"),
    dev(Family::F3, 0x439, 64, F3_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F301xx/F302x4(6/8)/F318xx"),
    dev(Family::F3, 0x438, 64, F3_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F303x4(6/8)/F334xx/F328xx"),
    dev(Family::F3, 0x446, 512, F3_FLASH_SIZE, 5000, EraseCommand::Standard, 0x2000_1000, "STM32F302xD(E)/F303xD(E)/F398xx"),

    dev(Family::F4, 0x413, 1024, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F40xxx/41xxx"),
    dev(Family::F4, 0x419, 2048, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F42xxx/43xxx"),
    dev(Family::F4, 0x423, 256, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F401xB(C)"),
    dev(Family::F4, 0x433, 512, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F401xD(E)"),
    dev(Family::F4, 0x431, 512, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F411xx"),
    dev(Family::F4, 0x434, 2048, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F469xx/479xx"),
    dev(Family::F4, 0x458, 128, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F410xx"),
    dev(Family::F4, 0x441, 1024, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F412xx"),
    dev(Family::F4, 0x463, 1536, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F413xx/423xx"),
    dev(Family::F4, 0x421, 512, F4_FLASH_SIZE, 35000, EraseCommand::Extended, 0x2000_8000, "STM32F446xx"),

    dev(Family::F7, 0x452, 512, F7_FLASH_SIZE, 20000, EraseCommand::Standard, 0x2002_0000, "STM32F72xxx/73xxx"),
    dev(Family::F7, 0x449, 1024, F7_FLASH_SIZE, 20000, EraseCommand::Standard, 0x2002_0000, "STM32F74xxx/75xxx"),
    dev(Family::F7, 0x451, 2048, F7_FLASH_SIZE, 20000, EraseCommand::Standard, 0x2002_0000, "STM32F76xxx/77xxx"),

    dev(Family::H5, 0x474, 512, H5_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_4000, "STM32H503xx"),
    dev(Family::H5, 0x484, 1024, H5_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_4000, "STM32H5A3xx/H56xxx/H57xxx"),
    dev(Family::H5, 0x478, 256, H5_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_4000, "STM32H563xx"),

    dev(Family::H7, 0x485, 2048, H7_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_8000, "STM32H7Rxxx/7Sxxx"),
    dev(Family::H7, 0x480, 2048, H7_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_8000, "STM32H7A3xx/7B3xx/7B0xx"),
    dev(Family::H7, 0x483, 2048, H7_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_8000, "STM32H72xxx/73xxx"),
    dev(Family::H7, 0x450, 2048, H7_FLASH_SIZE, 40000, EraseCommand::Extended, 0x2000_8000, "STM32H74xxx/75xxx"),

    dev(Family::L0, 0x457, 16, L0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_0400, "STM32L01xxx/02xxx"),
    dev(Family::L0, 0x425, 32, L0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_0400, "STM32L031xx/041xx"),
    dev(Family::L0, 0x417, 64, L0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_0400, "STM32L05xxx/06xxx"),
    dev(Family::L0, 0x447, 192, L0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_0400, "STM32L07xxx/08xxx"),

    dev(Family::L1, 0x416, 128, L1_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_1000, "STM32L1xxx6(8/B)"),
    dev(Family::L1, 0x429, 128, L1_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_1000, "STM32L1xxx6(8/B)A"),
    dev(Family::L1, 0x427, 256, L1_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_1000, "STM32L1xxxC"),
    dev(Family::L1, 0x436, 384, L1_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_1000, "STM32L1xxxD"),
    dev(Family::L1, 0x437, 512, L1_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_1000, "STM32L1xxxE"),

    dev(Family::L4, 0x464, 2048, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L4Rxxx/4Sxxx"),
    dev(Family::L4, 0x435, 256, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L43xxx/44xxx"),
    dev(Family::L4, 0x462, 512, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L45xxx/46xxx"),
    dev(Family::L4, 0x415, 1024, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L47xxx/48xxx"),
    dev(Family::L4, 0x461, 1024, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L496xx/4A6xx"),
    dev(Family::L4, 0x470, 512, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L41xxx/42xxx"),
    dev(Family::L4, 0x471, 1024, L4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L4P5xx/4Q5xx"),

    dev(Family::L5, 0x472, 512, L5_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32L55xxx/56xxx"),

    dev(Family::G0, 0x466, 64, G0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_1000, "STM32G0C1xx"),
    dev(Family::G0, 0x456, 32, G0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_1000, "STM32G0B0xx/B1xx"),
    dev(Family::G0, 0x460, 128, G0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_1000, "STM32G07xxx/08xxx"),
    dev(Family::G0, 0x467, 64, G0_FLASH_SIZE, 3000, EraseCommand::Standard, 0x2000_1000, "STM32G031xx/041xx"),

    dev(Family::G4, 0x468, 512, G4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_4000, "STM32G43xxx/44xxx"),
    dev(Family::G4, 0x469, 128, G4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_4000, "STM32G47xxx/48xxx"),
    dev(Family::G4, 0x479, 512, G4_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_4000, "STM32G49xxx/4Axxx"),

    dev(Family::WB, 0x494, 1024, WB_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32WB55xx/35xx"),
    dev(Family::WB, 0x495, 512, WB_FLASH_SIZE, 8000, EraseCommand::Standard, 0x2000_8000, "STM32WB10xx/15xx/50xx"),
];

/// Resolve a device identifier, the top four bits are ignored.
///
/// Unknown identifiers yield [`UNKNOWN`] carrying the masked identifier.
pub fn lookup(device_id: u16) -> DeviceDescriptor {
    let id = device_id & DEVICE_ID_MASK;

    DEVICES
        .iter()
        .find(|d| d.device_id == id)
        .copied()
        .unwrap_or(DeviceDescriptor {
            device_id: id,
            ..UNKNOWN
        })
}
