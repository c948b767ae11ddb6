use log::{debug, info};
use serialport::{available_ports, SerialPortInfo};

use super::{config::Config, ConnectArgs};
use crate::error::Error;

/// Name of the serial port to connect through
///
/// A port given as a command-line argument takes precedence over one from the
/// configuration file. Without either, the only port present on the system is
/// used.
pub fn get_serial_port(args: &ConnectArgs, config: &Config) -> Result<String, Error> {
    if let Some(serial) = args.port.as_ref().or(config.connection.serial.as_ref()) {
        return check_serial_port(serial);
    }

    let ports = available_ports()?;
    debug!("Detected serial ports: {ports:?}");

    select_serial_port(&ports)
}

// Ports missing from the enumeration may still be valid (pseudo terminals,
// adapters the platform does not report), so only the device node is checked
#[cfg(not(target_os = "windows"))]
fn check_serial_port(name: &str) -> Result<String, Error> {
    if std::path::Path::new(name).exists() {
        Ok(name.to_owned())
    } else {
        Err(Error::SerialNotFound(name.to_owned()))
    }
}

#[cfg(target_os = "windows")]
fn check_serial_port(name: &str) -> Result<String, Error> {
    let ports = available_ports()?;

    ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(name))
        .map(|port| port.port_name.clone())
        .ok_or_else(|| Error::SerialNotFound(name.to_owned()))
}

fn select_serial_port(ports: &[SerialPortInfo]) -> Result<String, Error> {
    match ports {
        [] => Err(Error::NoSerial),
        [port] => {
            info!("Using serial port {}", port.port_name);
            Ok(port.port_name.clone())
        }
        ports => {
            let names = ports
                .iter()
                .map(|port| port.port_name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(Error::MultipleSerial(names))
        }
    }
}
