use std::{fs, net::IpAddr};

use anyhow::{anyhow, Result};
use cidr::IpCidr;
use glob::glob;
use serde::Serialize;
use serde_derive::Deserialize;
use tracing::info;

use crate::utils;

const ASSETS_GLOB: &str = "assets_*.json";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NetworkAsset {
    pub name: String,
    pub cidr: IpCidr,
    #[serde(default)]
    pub value: u8,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct NetworkAssets {
    pub assets: Vec<NetworkAsset>,
    #[serde(skip_deserializing)]
    pub home_net: Vec<IpCidr>,
}

impl NetworkAssets {
    pub fn from_string(s: String) -> Result<NetworkAssets> {
        let mut result = NetworkAssets { assets: vec![], home_net: vec![] };
        let loaded: NetworkAssets = serde_json::from_str(&s)?;
        for a in loaded.assets {
            validate_asset(&a)?;
            result.home_net.push(a.cidr);
            result.assets.push(a);
        }
        Ok(result)
    }

    pub fn new(test_env: bool, subdir: Option<Vec<String>>) -> Result<NetworkAssets> {
        let cfg_dir = utils::config_dir(test_env, subdir)?;
        let glob_pattern = cfg_dir.to_string_lossy().to_string() + "/" + ASSETS_GLOB;
        let mut result = NetworkAssets { assets: vec![], home_net: vec![] };
        for file_path in glob(&glob_pattern)?.flatten() {
            info!("reading {:?}", file_path);
            let s = fs::read_to_string(file_path)?;
            let mut r = NetworkAssets::from_string(s)?;
            result.assets.append(&mut r.assets);
            result.home_net.append(&mut r.home_net);
        }
        if result.assets.is_empty() {
            return Err(anyhow!("cannot load any asset"));
        }
        info!("{} assets found and loaded", result.assets.len());
        result.assets.shrink_to_fit();
        Ok(result)
    }

    pub fn is_in_homenet(&self, ip: &IpAddr) -> bool {
        self.home_net.iter().any(|net| net.contains(ip))
    }

    /// Highest value among assets covering the address, 0 when unknown.
    pub fn get_value(&self, ip: &IpAddr) -> u8 {
        self.assets
            .iter()
            .filter(|n| n.cidr.contains(ip))
            .max_by_key(|x| x.value)
            .map(|x| x.value)
            .unwrap_or_default()
    }

    /// Name of the host asset exactly matching the address, empty when
    /// unknown.
    pub fn get_name(&self, ip: &IpAddr) -> String {
        self.assets
            .iter()
            .filter(|n| n.cidr.contains(ip) && n.cidr.is_host_address())
            .map(|n| n.name.clone())
            .next()
            .unwrap_or_default()
    }
}

fn validate_asset(asset: &NetworkAsset) -> Result<()> {
    if asset.value == 0 {
        return Err(anyhow!("asset {} value cannot be 0", asset.name));
    }
    if asset.name.is_empty() {
        return Err(anyhow!("asset name cannot be empty"));
    }
    Ok(())
}
