//! HD44780 character LCD behind a PCF8574 I2C backpack, driven in 4-bit mode.

use std::thread;
use std::time::Duration;

use esp_idf_hal::i2c::I2cDriver;

use safehome_common::display::{Screen, DEGREE, LCD_COLS, LCD_ROWS};

const RS: u8 = 0x01;
const ENABLE: u8 = 0x04;
const BACKLIGHT: u8 = 0x08;

const CMD_CLEAR: u8 = 0x01;
const CMD_ENTRY_MODE_INC: u8 = 0x06;
const CMD_DISPLAY_ON: u8 = 0x0C;
const CMD_FUNCTION_4BIT_2LINE: u8 = 0x28;
const CMD_SET_DDRAM: u8 = 0x80;

const ROW_OFFSETS: [u8; LCD_ROWS] = [0x00, 0x40, 0x14, 0x54];
const DEGREE_GLYPH: u8 = 0xDF;

pub struct Lcd {
    i2c: I2cDriver<'static>,
    addr: u8,
    shown: Option<Screen>,
}

impl Lcd {
    pub fn new(i2c: I2cDriver<'static>, addr: u8) -> anyhow::Result<Self> {
        let mut lcd = Self {
            i2c,
            addr,
            shown: None,
        };
        lcd.init()?;
        Ok(lcd)
    }

    fn init(&mut self) -> anyhow::Result<()> {
        thread::sleep(Duration::from_millis(50));

        // Reset into 8-bit mode three times, then drop to 4-bit.
        for wait_us in [4_500, 150, 150] {
            self.write_nibble(0x30, 0)?;
            thread::sleep(Duration::from_micros(wait_us));
        }
        self.write_nibble(0x20, 0)?;

        self.command(CMD_FUNCTION_4BIT_2LINE)?;
        self.command(CMD_DISPLAY_ON)?;
        self.command(CMD_ENTRY_MODE_INC)?;
        self.clear()
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.command(CMD_CLEAR)?;
        thread::sleep(Duration::from_millis(2));
        self.shown = None;
        Ok(())
    }

    /// Writes only the rows that differ from what is already on the glass.
    pub fn show(&mut self, screen: &Screen) -> anyhow::Result<()> {
        for (row, line) in screen.iter().enumerate() {
            let unchanged = self
                .shown
                .as_ref()
                .is_some_and(|shown| shown[row] == *line);
            if !unchanged {
                self.write_row(row, line)?;
            }
        }
        self.shown = Some(screen.clone());
        Ok(())
    }

    fn write_row(&mut self, row: usize, line: &str) -> anyhow::Result<()> {
        self.command(CMD_SET_DDRAM | ROW_OFFSETS[row])?;

        let mut written = 0;
        for ch in line.chars().take(LCD_COLS) {
            self.data(glyph(ch))?;
            written += 1;
        }
        for _ in written..LCD_COLS {
            self.data(b' ')?;
        }
        Ok(())
    }

    fn command(&mut self, value: u8) -> anyhow::Result<()> {
        self.write_byte(value, 0)
    }

    fn data(&mut self, value: u8) -> anyhow::Result<()> {
        self.write_byte(value, RS)
    }

    fn write_byte(&mut self, value: u8, mode: u8) -> anyhow::Result<()> {
        self.write_nibble(value & 0xF0, mode)?;
        self.write_nibble((value << 4) & 0xF0, mode)
    }

    fn write_nibble(&mut self, nibble: u8, mode: u8) -> anyhow::Result<()> {
        let bits = nibble | mode | BACKLIGHT;
        self.i2c
            .write(self.addr, &[bits | ENABLE], esp_idf_hal::delay::BLOCK)?;
        self.i2c
            .write(self.addr, &[bits], esp_idf_hal::delay::BLOCK)?;
        thread::sleep(Duration::from_micros(50));
        Ok(())
    }
}

fn glyph(ch: char) -> u8 {
    match ch {
        DEGREE => DEGREE_GLYPH,
        ' '..='~' => ch as u8,
        _ => b'?',
    }
}
