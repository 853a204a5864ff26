//! Bus enumeration and connectivity probing.
//!
//! Three transport classes are scanned during discovery: USB-class and GPIB
//! instrument resources, and the FTDI-based relay controller. Probing asks
//! bus instruments for their identity and opens/closes the relay controller.
//!
//! Concrete back-ends are feature-gated:
//!
//! | Feature | Type | Transport |
//! |---------|------|-----------|
//! | `instrument_serial` | `FtdiSerialScanner` | FTDI (USB VID 0x0403) |
//! | `instrument_visa` | `VisaScanner`, `VisaProbe` | USB, GPIB |

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Transport class scanned during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    Usb,
    Gpib,
    Ftdi,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Usb => write!(f, "USB"),
            Transport::Gpib => write!(f, "GPIB"),
            Transport::Ftdi => write!(f, "FTDI"),
        }
    }
}

/// Capability: enumerate the resources reachable on one transport.
#[async_trait]
pub trait BusScanner: Send + Sync {
    fn transport(&self) -> Transport;

    /// Resource strings (USB/GPIB) or serial numbers (FTDI).
    async fn scan(&self) -> Result<Vec<String>>;
}

/// Capability: check that a configured device answers.
#[async_trait]
pub trait InstrumentProbe: Send + Sync {
    /// Send the identity query to a bus instrument and return its answer.
    async fn identify(&self, address: &str) -> Result<String>;

    /// Open and close a session on the relay controller.
    async fn open_close_relay(&self, serial: &str) -> Result<()>;
}

/// FTDI relay-controller enumeration through the OS serial port list.
#[cfg(feature = "instrument_serial")]
pub struct FtdiSerialScanner;

#[cfg(feature = "instrument_serial")]
impl FtdiSerialScanner {
    /// USB vendor id of FTDI.
    pub const FTDI_VID: u16 = 0x0403;
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl BusScanner for FtdiSerialScanner {
    fn transport(&self) -> Transport {
        Transport::Ftdi
    }

    async fn scan(&self) -> Result<Vec<String>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports).await??;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(info) if info.vid == Self::FTDI_VID => {
                    Some(info.serial_number.unwrap_or(port.port_name))
                }
                _ => None,
            })
            .collect())
    }
}

#[cfg(feature = "instrument_visa")]
mod visa {
    use super::*;
    use anyhow::anyhow;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::time::Duration;
    use visa_rs::prelude::*;

    fn find_resources(expr: &str) -> Result<Vec<String>> {
        let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager: {}", e))?;
        let expr = CString::new(expr)?;
        let mut list = match rm.find_res_list(&expr.into()) {
            Ok(list) => list,
            // VI_ERROR_RSRC_NFOUND: nothing on this bus
            Err(_) => return Ok(Vec::new()),
        };
        let mut found = Vec::new();
        while let Some(res) = list
            .find_next()
            .map_err(|e| anyhow!("VISA enumeration: {}", e))?
        {
            found.push(res.to_string());
        }
        Ok(found)
    }

    /// USB or GPIB enumeration through VISA.
    pub struct VisaScanner {
        transport: Transport,
    }

    impl VisaScanner {
        pub fn usb() -> Self {
            Self {
                transport: Transport::Usb,
            }
        }

        pub fn gpib() -> Self {
            Self {
                transport: Transport::Gpib,
            }
        }
    }

    #[async_trait]
    impl BusScanner for VisaScanner {
        fn transport(&self) -> Transport {
            self.transport
        }

        async fn scan(&self) -> Result<Vec<String>> {
            let expr = match self.transport {
                Transport::Usb => "USB?*INSTR",
                Transport::Gpib => "GPIB?*INSTR",
                Transport::Ftdi => return Ok(Vec::new()),
            };
            tokio::task::spawn_blocking(move || find_resources(expr)).await?
        }
    }

    /// `*IDN?` probing through VISA. Relay probing is delegated.
    pub struct VisaProbe<R> {
        pub timeout: Duration,
        pub relay: R,
    }

    fn query_idn(address: &str, timeout: Duration) -> Result<String> {
        let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager: {}", e))?;
        let res = CString::new(address)?;
        let mut instr = rm
            .open(&res.into(), AccessMode::NO_LOCK, timeout)
            .map_err(|e| anyhow!("open {}: {}", address, e))?;
        instr.write_all(b"*IDN?\n")?;
        let mut response = String::new();
        BufReader::new(&instr).read_line(&mut response)?;
        Ok(response.trim().to_string())
    }

    #[async_trait]
    impl<R: crate::relay::RelayTransport> InstrumentProbe for VisaProbe<R> {
        async fn identify(&self, address: &str) -> Result<String> {
            let address = address.to_string();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || query_idn(&address, timeout)).await?
        }

        async fn open_close_relay(&self, serial: &str) -> Result<()> {
            let mut session = self.relay.open(serial).await?;
            session.close().await
        }
    }
}

#[cfg(feature = "instrument_visa")]
pub use visa::{VisaProbe, VisaScanner};
