//! Board identification.
//!
//! Detection walks a fallback chain: device-tree model string, then the
//! device-tree compatible string, then `/etc/os-release`, then the CPU
//! architecture. Each stage carries its own confidence; ≥ 50 counts as
//! "detected". The result is advisory: it seeds the pin map shown by
//! discovery but never blocks an explicit configuration.

use std::path::Path;

use serde::Serialize;

/// Known board families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardType {
    RaspberryPi5,
    RaspberryPi4,
    RaspberryPi3,
    RaspberryPiOther,
    BeagleBoneBlack,
    OrangePi,
    /// Unidentified Linux SBC; conservative defaults.
    Generic,
}

/// Bus and pin suggestions for a detected board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinMap {
    /// I²C bus indices expected to be usable.
    pub i2c_buses: Vec<u8>,
    /// SPI (bus, chip-select) pair.
    pub spi: (u8, u8),
    /// GPIO chip label for actuator lines.
    pub gpio_chip: String,
    /// Line offsets free for general use.
    pub suggested_gpios: Vec<u32>,
}

/// Detection result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardInfo {
    pub board: BoardType,
    /// Raw identity string the detection matched on.
    pub identity: String,
    /// 0–100; ≥ 50 counts as detected.
    pub confidence: u8,
    pub pins: PinMap,
}

impl BoardInfo {
    /// Whether detection confidence reaches the "detected" bar.
    pub const fn detected(&self) -> bool {
        self.confidence >= 50
    }
}

/// Model-string fragments → board type. First match wins.
const MODEL_TABLE: &[(&str, BoardType)] = &[
    ("Raspberry Pi 5", BoardType::RaspberryPi5),
    ("Raspberry Pi 4", BoardType::RaspberryPi4),
    ("Raspberry Pi 3", BoardType::RaspberryPi3),
    ("Raspberry Pi", BoardType::RaspberryPiOther),
    ("BeagleBone Black", BoardType::BeagleBoneBlack),
    ("Orange Pi", BoardType::OrangePi),
];

fn pin_map(board: BoardType) -> PinMap {
    match board {
        BoardType::RaspberryPi5 => PinMap {
            i2c_buses: vec![1, 3],
            spi: (0, 0),
            gpio_chip: "gpiochip4".to_string(),
            suggested_gpios: vec![17, 22, 23, 24, 25, 27],
        },
        BoardType::RaspberryPi4 | BoardType::RaspberryPi3 | BoardType::RaspberryPiOther => {
            PinMap {
                i2c_buses: vec![1],
                spi: (0, 0),
                gpio_chip: "gpiochip0".to_string(),
                suggested_gpios: vec![17, 22, 23, 24, 25, 27],
            }
        }
        BoardType::BeagleBoneBlack => PinMap {
            i2c_buses: vec![1, 2],
            spi: (0, 0),
            gpio_chip: "gpiochip1".to_string(),
            suggested_gpios: vec![12, 13, 14, 15],
        },
        BoardType::OrangePi => PinMap {
            i2c_buses: vec![0],
            spi: (0, 0),
            gpio_chip: "gpiochip0".to_string(),
            suggested_gpios: vec![7, 8, 9, 10],
        },
        BoardType::Generic => PinMap {
            i2c_buses: vec![0, 1],
            spi: (0, 0),
            gpio_chip: "gpiochip0".to_string(),
            suggested_gpios: Vec::new(),
        },
    }
}

/// Detect the board from the standard system paths.
pub fn detect() -> BoardInfo {
    detect_at(Path::new("/"))
}

/// Detection against an alternate root, for tests.
pub fn detect_at(root: &Path) -> BoardInfo {
    // 1. Device-tree model string.
    if let Ok(model) = std::fs::read_to_string(root.join("proc/device-tree/model")) {
        let model = model.trim_end_matches('\0').trim().to_string();
        if let Some(board) = match_table(&model) {
            return info(board, model, 95);
        }
        if !model.is_empty() {
            return info(BoardType::Generic, model, 55);
        }
    }

    // 2. Device-tree compatible string (NUL-separated list).
    if let Ok(compat) = std::fs::read_to_string(root.join("proc/device-tree/compatible")) {
        let first = compat.split('\0').next().unwrap_or("").to_string();
        if let Some(board) = match_compatible(&compat) {
            return info(board, first, 85);
        }
        if !first.is_empty() {
            return info(BoardType::Generic, first, 50);
        }
    }

    // 3. OS release hints.
    if let Ok(os_release) = std::fs::read_to_string(root.join("etc/os-release")) {
        if os_release.contains("raspbian") || os_release.contains("Raspberry") {
            return info(
                BoardType::RaspberryPiOther,
                "os-release: raspbian".to_string(),
                60,
            );
        }
    }

    // 4. CPU architecture fallback; never "detected".
    info(
        BoardType::Generic,
        format!("arch: {}", std::env::consts::ARCH),
        30,
    )
}

fn match_table(model: &str) -> Option<BoardType> {
    MODEL_TABLE
        .iter()
        .find(|(pat, _)| model.contains(pat))
        .map(|(_, board)| *board)
}

fn match_compatible(compat: &str) -> Option<BoardType> {
    if compat.contains("raspberrypi,5") {
        Some(BoardType::RaspberryPi5)
    } else if compat.contains("raspberrypi,4") {
        Some(BoardType::RaspberryPi4)
    } else if compat.contains("raspberrypi,3") {
        Some(BoardType::RaspberryPi3)
    } else if compat.contains("raspberrypi") {
        Some(BoardType::RaspberryPiOther)
    } else if compat.contains("ti,am335x-bone-black") {
        Some(BoardType::BeagleBoneBlack)
    } else if compat.contains("xunlong,orangepi") {
        Some(BoardType::OrangePi)
    } else {
        None
    }
}

fn info(board: BoardType, identity: String, confidence: u8) -> BoardInfo {
    BoardInfo {
        board,
        identity,
        confidence,
        pins: pin_map(board),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("proc/device-tree")).unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        dir
    }

    #[test]
    fn model_string_wins_with_high_confidence() {
        let root = fake_root();
        fs::write(
            root.path().join("proc/device-tree/model"),
            "Raspberry Pi 4 Model B Rev 1.5\0",
        )
        .unwrap();

        let detected = detect_at(root.path());
        assert_eq!(detected.board, BoardType::RaspberryPi4);
        assert_eq!(detected.confidence, 95);
        assert!(detected.detected());
        assert_eq!(detected.pins.gpio_chip, "gpiochip0");
    }

    #[test]
    fn unknown_model_string_is_generic_but_detected() {
        let root = fake_root();
        fs::write(
            root.path().join("proc/device-tree/model"),
            "Frobnicator 9000\0",
        )
        .unwrap();

        let detected = detect_at(root.path());
        assert_eq!(detected.board, BoardType::Generic);
        assert!(detected.detected());
    }

    #[test]
    fn compatible_string_fallback() {
        let root = fake_root();
        fs::write(
            root.path().join("proc/device-tree/compatible"),
            "raspberrypi,5-model-b\0brcm,bcm2712\0",
        )
        .unwrap();

        let detected = detect_at(root.path());
        assert_eq!(detected.board, BoardType::RaspberryPi5);
        assert_eq!(detected.confidence, 85);
        assert_eq!(detected.pins.gpio_chip, "gpiochip4");
    }

    #[test]
    fn os_release_fallback() {
        let root = fake_root();
        fs::write(
            root.path().join("etc/os-release"),
            "ID=raspbian\nNAME=\"Raspbian GNU/Linux\"\n",
        )
        .unwrap();

        let detected = detect_at(root.path());
        assert_eq!(detected.board, BoardType::RaspberryPiOther);
        assert_eq!(detected.confidence, 60);
    }

    #[test]
    fn arch_fallback_is_not_detected() {
        let root = fake_root();
        let detected = detect_at(root.path());
        assert_eq!(detected.board, BoardType::Generic);
        assert!(!detected.detected());
    }
}
