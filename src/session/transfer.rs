use super::*;
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Checksum reported for a file that does not exist yet on the receiving side.
pub const NO_FILE: &str = "no_file";

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hex checksum of an in-memory buffer.
pub fn checksum_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.hex()
}

/// Hex checksum of a local file, read in fixed-size blocks.
///
/// A missing file yields [`NO_FILE`] when the file is about to be fetched
/// from the device, and an error when it is about to be sent.
pub async fn local_checksum(
    path: &Path,
    direction: TransferDirection,
    algorithm: ChecksumAlgorithm,
) -> Result<String, DeviceError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && direction == TransferDirection::Get => {
            return Ok(NO_FILE.to_string());
        }
        Err(e) => {
            return Err(DeviceError::Validation(format!(
                "Unable to read the local file {}. {e}",
                path.display()
            )));
        }
    };
    let mut hasher = Hasher::new(algorithm);
    let mut block = vec![0u8; config::CHECKSUM_BLOCK_SIZE];
    loop {
        let n = file.read(&mut block).await?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hasher.hex())
}

/// Final state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Transferred,
    AlreadyPresent,
    Failed,
}

/// Result of one put or get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransferRecord {
    pub protocol: FileProtocol,
    pub direction: TransferDirection,
    pub local: PathBuf,
    pub remote: String,
    /// Checksums as last observed. Absent for unverified transfers.
    pub local_checksum: Option<String>,
    pub remote_checksum: Option<String>,
    pub bytes: u64,
    pub status: TransferStatus,
    pub changed: bool,
    pub msg: String,
}

impl TransferRecord {
    fn new(protocol: FileProtocol, direction: TransferDirection, local: &Path, remote: &str) -> Self {
        Self {
            protocol,
            direction,
            local: local.to_path_buf(),
            remote: remote.to_string(),
            local_checksum: None,
            remote_checksum: None,
            bytes: 0,
            status: TransferStatus::Failed,
            changed: false,
            msg: String::new(),
        }
    }

    pub fn failed(&self) -> bool {
        self.status == TransferStatus::Failed
    }
}

fn is_missing_file(error: &DeviceError) -> bool {
    error.to_string().contains("No such file or directory")
}

impl ConnectionManager {
    /// Checksum of a device file.
    ///
    /// A missing file yields [`NO_FILE`] when the file is about to be sent
    /// to the device; otherwise the error is returned.
    pub async fn remote_checksum(
        &mut self,
        remote: &str,
        direction: TransferDirection,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, DeviceError> {
        self.open().await?;
        match self.backend.checksum(remote, algorithm).await {
            Ok(checksum) => Ok(checksum),
            Err(e) if direction == TransferDirection::Put && is_missing_file(&e) => {
                debug!("{} {} does not exist on the device.", self.label, remote);
                Ok(NO_FILE.to_string())
            }
            Err(e) => Err(e),
        }
    }

    fn record_transfer(&self, record: &TransferRecord) {
        self.record(SessionEvent::TransferCompleted {
            protocol: record.protocol,
            direction: record.direction,
            local: record.local.display().to_string(),
            remote: record.remote.clone(),
            changed: record.changed,
            failed: record.failed(),
            message: record.msg.clone(),
        });
    }

    fn integrity_failure(
        &self,
        record: &mut TransferRecord,
        algorithm: ChecksumAlgorithm,
        local_checksum: String,
        remote_checksum: String,
    ) -> DeviceError {
        let error = DeviceError::TransferIntegrity {
            algorithm,
            local_checksum,
            remote_checksum,
        };
        record.msg = error.to_string();
        warn!("{} {}", self.label, record.msg);
        self.record_transfer(record);
        error
    }

    /// Copy a local file to the device unless an identical copy is already there.
    ///
    /// The checksum is compared again after the copy; a mismatch is a
    /// [`DeviceError::TransferIntegrity`] naming both values.
    pub async fn put_verified(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
        algorithm: ChecksumAlgorithm,
    ) -> Result<TransferRecord, DeviceError> {
        let mut record = TransferRecord::new(protocol, TransferDirection::Put, local, remote);
        let local_sum = local_checksum(local, TransferDirection::Put, algorithm).await?;
        let remote_sum = self
            .remote_checksum(remote, TransferDirection::Put, algorithm)
            .await?;
        debug!(
            "{} Local checksum: {}, remote checksum: {}",
            self.label, local_sum, remote_sum
        );
        record.local_checksum = Some(local_sum.clone());

        if remote_sum != NO_FILE && remote_sum == local_sum {
            record.remote_checksum = Some(remote_sum);
            record.status = TransferStatus::AlreadyPresent;
            record.msg = format!("File already present, skipping the {protocol}");
            self.record_transfer(&record);
            return Ok(record);
        }

        debug!("{} File not present, need to transfer", self.label);
        record.bytes = self.backend.put_file(protocol, local, remote).await?;
        let remote_sum = self
            .remote_checksum(remote, TransferDirection::Put, algorithm)
            .await?;
        if remote_sum != local_sum {
            record.remote_checksum = Some(remote_sum.clone());
            return Err(self.integrity_failure(&mut record, algorithm, local_sum, remote_sum));
        }
        record.remote_checksum = Some(remote_sum);
        record.status = TransferStatus::Transferred;
        record.changed = true;
        record.msg = "File pushed OK".to_string();
        debug!("{} {} pushed to {}.", self.label, local.display(), remote);
        self.record_transfer(&record);
        Ok(record)
    }

    /// Copy a device file to the local host unless an identical local copy exists.
    pub async fn get_verified(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
        algorithm: ChecksumAlgorithm,
    ) -> Result<TransferRecord, DeviceError> {
        let mut record = TransferRecord::new(protocol, TransferDirection::Get, local, remote);
        let remote_sum = self
            .remote_checksum(remote, TransferDirection::Get, algorithm)
            .await?;
        let local_sum = local_checksum(local, TransferDirection::Get, algorithm).await?;
        record.remote_checksum = Some(remote_sum.clone());

        if local_sum != NO_FILE && local_sum == remote_sum {
            record.local_checksum = Some(local_sum);
            record.status = TransferStatus::AlreadyPresent;
            record.msg = format!("File already present, skipping the {protocol}");
            self.record_transfer(&record);
            return Ok(record);
        }

        debug!("{} File not present, need to transfer", self.label);
        record.bytes = self.backend.get_file(protocol, remote, local).await?;
        let local_sum = local_checksum(local, TransferDirection::Get, algorithm).await?;
        record.local_checksum = Some(local_sum.clone());
        if local_sum != remote_sum {
            return Err(self.integrity_failure(&mut record, algorithm, local_sum, remote_sum));
        }
        record.status = TransferStatus::Transferred;
        record.changed = true;
        record.msg = "File pulled OK".to_string();
        self.record_transfer(&record);
        Ok(record)
    }

    /// Copy a local file to the device without checksums.
    ///
    /// Transfer errors are reported in the record, not returned.
    pub async fn put_unverified(
        &mut self,
        protocol: FileProtocol,
        local: &Path,
        remote: &str,
    ) -> Result<TransferRecord, DeviceError> {
        self.open().await?;
        let mut record = TransferRecord::new(protocol, TransferDirection::Put, local, remote);
        let result = self.backend.put_file(protocol, local, remote).await;
        self.finish_unverified(&mut record, result, "File pushed OK");
        Ok(record)
    }

    /// Copy a device file to the local host without checksums.
    pub async fn get_unverified(
        &mut self,
        protocol: FileProtocol,
        remote: &str,
        local: &Path,
    ) -> Result<TransferRecord, DeviceError> {
        self.open().await?;
        let mut record = TransferRecord::new(protocol, TransferDirection::Get, local, remote);
        let result = self.backend.get_file(protocol, remote, local).await;
        self.finish_unverified(&mut record, result, "File pulled OK");
        Ok(record)
    }

    fn finish_unverified(
        &self,
        record: &mut TransferRecord,
        result: Result<u64, DeviceError>,
        success: &str,
    ) {
        match result {
            Ok(bytes) => {
                record.bytes = bytes;
                record.status = TransferStatus::Transferred;
                record.changed = true;
                record.msg = success.to_string();
            }
            // The FTP server refused the copy.
            Err(DeviceError::Rpc { message, .. }) if record.protocol == FileProtocol::Ftp => {
                debug!("{} {}", self.label, message);
                record.msg = "Transfer failed".to_string();
            }
            Err(e) => {
                record.msg = format!("Error: {e}");
            }
        }
        self.record_transfer(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_digests() {
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Md5, b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn streamed_checksum_matches_buffer_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..(config::CHECKSUM_BLOCK_SIZE * 2 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        file.write_all(&data).unwrap();
        let sum = local_checksum(file.path(), TransferDirection::Put, ChecksumAlgorithm::Md5)
            .await
            .unwrap();
        assert_eq!(sum, checksum_bytes(ChecksumAlgorithm::Md5, &data));
    }

    #[tokio::test]
    async fn missing_local_file_is_no_file_only_for_get() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.tgz");
        assert_eq!(
            local_checksum(&missing, TransferDirection::Get, ChecksumAlgorithm::Md5)
                .await
                .unwrap(),
            NO_FILE
        );
        assert!(
            local_checksum(&missing, TransferDirection::Put, ChecksumAlgorithm::Md5)
                .await
                .is_err()
        );
    }
}
