//! ISO 7816-4 command and response APDUs

use thiserror::Error;

/// APDU errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApduError {
    #[error("Response too short: {0} bytes (need at least 2 for the status word)")]
    ResponseTooShort(usize),

    #[error("Command data too large: {size} bytes (max: {max})")]
    DataTooLarge { size: usize, max: usize },

    #[error("Expected length too large: {le} (max: {max})")]
    LeTooLarge { le: u32, max: u32 },
}

/// Largest data field an extended-length APDU can carry
pub const MAX_EXTENDED_DATA: usize = 65_535;

/// Largest expected length an extended-length APDU can request (0x0000 means 65536)
pub const MAX_EXTENDED_LE: u32 = 65_536;

/// Instruction byte of GET RESPONSE
pub const INS_GET_RESPONSE: u8 = 0xC0;

/// Instruction byte of SELECT
pub const INS_SELECT: u8 = 0xA4;

/// Status words the session layer inspects
pub mod sw {
    /// Normal processing
    pub const SUCCESS: u16 = 0x9000;
    /// SW1 signalling "more response bytes available, use GET RESPONSE"
    pub const MORE_DATA_SW1: u8 = 0x61;
    /// File or application not found
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    /// Instruction not supported
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
}

/// A command APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Command data field (Lc is derived from its length)
    pub data: Vec<u8>,
    /// Expected response length; 256 in short form and 65536 in extended form are encoded as 0
    pub le: Option<u32>,
}

impl Apdu {
    /// Create a command without data or expected length
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Attach a data field
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Attach an expected response length
    pub fn with_le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// SELECT by AID (`00 A4 04 00 Lc AID`)
    pub fn select(aid: &[u8]) -> Self {
        Self::new(0x00, INS_SELECT, 0x04, 0x00).with_data(aid)
    }

    /// GET RESPONSE for the number of bytes announced by a `61xx` status
    pub fn get_response(available: u8) -> Self {
        let le = if available == 0 { 256 } else { available as u32 };
        Self::new(0x00, INS_GET_RESPONSE, 0x00, 0x00).with_le(le)
    }

    /// Whether this command needs the extended-length encoding
    pub fn is_extended(&self) -> bool {
        self.data.len() > 255 || self.le.is_some_and(|le| le > 256)
    }

    /// Encode into the byte form sent to the card
    ///
    /// Short form is used whenever the data fits in 255 bytes and Le fits in
    /// 256; otherwise the whole command switches to extended form.
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        if self.data.len() > MAX_EXTENDED_DATA {
            return Err(ApduError::DataTooLarge {
                size: self.data.len(),
                max: MAX_EXTENDED_DATA,
            });
        }
        if let Some(le) = self.le {
            if le > MAX_EXTENDED_LE {
                return Err(ApduError::LeTooLarge {
                    le,
                    max: MAX_EXTENDED_LE,
                });
            }
        }

        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if self.is_extended() {
            out.push(0x00);
            if !self.data.is_empty() {
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                // 65536 wraps to 0x0000 by definition
                out.extend_from_slice(&((le & 0xFFFF) as u16).to_be_bytes());
            }
        } else {
            if !self.data.is_empty() {
                out.push(self.data.len() as u8);
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                out.push((le & 0xFF) as u8);
            }
        }

        Ok(out)
    }
}

/// A response APDU: data followed by SW1 SW2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    /// Split raw response bytes into data and status word
    pub fn parse(bytes: &[u8]) -> Result<Self, ApduError> {
        if bytes.len() < 2 {
            return Err(ApduError::ResponseTooShort(bytes.len()));
        }
        let split = bytes.len() - 2;
        Ok(Self {
            data: bytes[..split].to_vec(),
            sw1: bytes[split],
            sw2: bytes[split + 1],
        })
    }

    /// Combined status word
    pub fn sw(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub fn is_success(&self) -> bool {
        self.sw() == sw::SUCCESS
    }

    /// Bytes still waiting on the card when SW1 is `61`
    ///
    /// `Some(0)` means 256 or more.
    pub fn more_data_available(&self) -> Option<u8> {
        (self.sw1 == sw::MORE_DATA_SW1).then_some(self.sw2)
    }

    /// Back to raw bytes (data || SW1 || SW2)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.push(self.sw1);
        out.push(self.sw2);
        out
    }
}
