//! Command implementations

use apdu_transport_omapi::{OmapiPlugin, OmapiReader, PluginSpi, ReaderSpi};
use tracing::{debug, info};

/// List the readers of the plugin
pub fn list_readers(plugin: &OmapiPlugin) {
    let readers = plugin.search_available_readers();
    if readers.is_empty() {
        println!("No readers found!");
        return;
    }

    println!("Available readers:");
    for (i, reader) in readers.iter().enumerate() {
        let status = if reader.check_card_presence() {
            "secure element present"
        } else {
            "no secure element"
        };
        println!("{}. {} [{}] ({})", i + 1, reader.name(), reader.native_name(), status);
    }
}

/// Pick the reader named `name`, or the first one with a secure element
pub fn find_reader(plugin: &OmapiPlugin, name: Option<&str>) -> eyre::Result<OmapiReader> {
    let mut readers = plugin.search_available_readers().into_iter();
    let reader = match name {
        Some(name) => readers
            .find(|r| r.name() == name || r.native_name() == name)
            .ok_or_else(|| eyre::eyre!("Reader '{name}' not found"))?,
        None => readers
            .find(|r| r.check_card_presence())
            .ok_or_else(|| eyre::eyre!("No secure element found in any reader!"))?,
    };

    info!(reader = reader.name(), "Using reader");
    Ok(reader)
}

/// Print the Answer To Reset of the secure element
pub fn atr(reader: &mut OmapiReader) -> eyre::Result<()> {
    reader.open_physical_channel()?;
    let atr = reader.power_on_data();
    reader.close_physical_channel();

    if atr.is_empty() {
        println!("ATR: not available");
    } else {
        println!("ATR: {atr}");
    }
    Ok(())
}

/// Open a channel and print the select response
pub fn select(reader: &mut OmapiReader, aid: Option<&[u8]>, mask: u8) -> eyre::Result<()> {
    reader.open_physical_channel()?;
    let result = reader.open_channel_for_aid(aid, mask);
    reader.close_physical_channel();

    let fci = result?;
    println!("Channel opened");
    println!("FCI: {}", hex::encode_upper(&fci));
    Ok(())
}

/// Open a channel and send each APDU over it
pub fn transmit(
    reader: &mut OmapiReader,
    aid: Option<&[u8]>,
    mask: u8,
    apdus: &[Vec<u8>],
) -> eyre::Result<()> {
    reader.open_physical_channel()?;
    let result = exchange(reader, aid, mask, apdus);
    reader.close_physical_channel();
    result
}

fn exchange(
    reader: &mut OmapiReader,
    aid: Option<&[u8]>,
    mask: u8,
    apdus: &[Vec<u8>],
) -> eyre::Result<()> {
    let fci = reader.open_channel_for_aid(aid, mask)?;
    debug!(fci = %hex::encode_upper(&fci), "Channel opened");

    for apdu in apdus {
        println!(">> {}", hex::encode_upper(apdu));
        let response = reader.transmit_apdu(apdu)?;
        println!("<< {}", hex::encode_upper(&response));
    }
    Ok(())
}
