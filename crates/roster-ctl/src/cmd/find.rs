//! Resolve a service name to an address.

use anyhow::Result;
use reqwest::Url;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct FindResponse {
    address: String,
}

pub async fn cmd_find(port: u16, name: &str, protocol: &str) -> Result<()> {
    let url = find_url(port, name, protocol)?;
    let resp: FindResponse = get_json(url.as_str()).await?;
    println!("{}", resp.address);
    Ok(())
}

fn find_url(port: u16, name: &str, protocol: &str) -> Result<Url> {
    Ok(Url::parse_with_params(
        &format!("{}/find", base_url(port)),
        &[("name", name), ("protocol", protocol)],
    )?)
}
