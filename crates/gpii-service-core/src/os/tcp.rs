//! IPv4 TCP connection table enumeration with owning pids.

use windows_sys::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, NO_ERROR};
use windows_sys::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, MIB_TCPROW_OWNER_PID, TCP_TABLE_OWNER_PID_ALL,
};
use windows_sys::Win32::Networking::WinSock::AF_INET;

use super::Win32Error;
use crate::transport::tcp::TcpTableRow;

/// Slack added to the table buffer between the size probe and the fetch, so
/// a table that grows concurrently still fits.
const REALLOC_MARGIN: u32 = 100;

/// Extract a host-order port from the DWORD the table stores it in.
///
/// The high 16 bits are documented as uninitialized and must be masked off;
/// the low word is in network byte order.
#[allow(clippy::cast_possible_truncation)]
fn port_of(dword: u32) -> u16 {
    u16::from_be((dword & 0xFFFF) as u16)
}

/// Fetch the IPv4 TCP table with per-row owning pids.
///
/// # Errors
///
/// Returns the failing call's status code.
pub fn tcp_table() -> Result<Vec<TcpTableRow>, Win32Error> {
    let mut size: u32 = 0;
    // SAFETY: a null table with size 0 is the documented size probe.
    let status = unsafe {
        GetExtendedTcpTable(
            std::ptr::null_mut(),
            &mut size,
            0,
            u32::from(AF_INET),
            TCP_TABLE_OWNER_PID_ALL,
            0,
        )
    };
    if status != ERROR_INSUFFICIENT_BUFFER && status != NO_ERROR {
        return Err(Win32Error::new(status));
    }

    size += REALLOC_MARGIN;
    // u32 backing keeps the buffer aligned for the table structs.
    let mut buf = vec![0u32; (size as usize).div_ceil(4)];
    // SAFETY: buf is writable for `size` bytes and aligned for the table.
    let status = unsafe {
        GetExtendedTcpTable(
            buf.as_mut_ptr().cast(),
            &mut size,
            0,
            u32::from(AF_INET),
            TCP_TABLE_OWNER_PID_ALL,
            0,
        )
    };
    if status != NO_ERROR {
        return Err(Win32Error::new(status));
    }

    let entries = buf[0] as usize;
    let mut rows = Vec::with_capacity(entries);
    // SAFETY: a successful fetch guarantees dwNumEntries rows directly after
    // the count field; rows are read unaligned to be layout-safe.
    unsafe {
        let first = buf.as_ptr().add(1).cast::<MIB_TCPROW_OWNER_PID>();
        for i in 0..entries {
            let row = first.add(i).read_unaligned();
            rows.push(TcpTableRow {
                local_port: port_of(row.dwLocalPort),
                remote_port: port_of(row.dwRemotePort),
                owning_pid: row.dwOwningPid,
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_masks_high_word_and_swaps() {
        // 0xDEAD in the uninitialized high word, port 80 (0x0050) stored
        // big-endian in the low word.
        assert_eq!(port_of(0xDEAD_5000), 80);
        assert_eq!(port_of(0x0000_5000), 80);
    }
}
