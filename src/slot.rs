//! 一度だけ読み込まれる共有リソースの入れ物
//!
//! 読み取りは `RwLock` による純粋な参照で、読み込みは非同期 `Mutex` で直列化する。
//! ロック取得後に再確認するため、同時に来た初回リクエストでも読み込みは1回だけ。
//! 値は完全に構築された `Arc<T>` として一度に差し替えるので、途中状態は見えない。

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;

pub struct LoadSlot<T> {
    value: RwLock<Option<Arc<T>>>,
    guard: Mutex<()>,
}

impl<T> Default for LoadSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LoadSlot<T> {
    pub fn new() -> Self {
        Self {
            value: RwLock::new(None),
            guard: Mutex::new(()),
        }
    }

    /// 読み込み済みの値（読み込みは行わない）
    pub fn get(&self) -> Option<Arc<T>> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn store(&self, value: Arc<T>) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// 未読み込みなら `load` を実行して格納する
    ///
    /// 失敗した場合は空のまま残り、次の呼び出しで再試行される。
    pub async fn get_or_try_load<F, Fut, E>(&self, load: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let _guard = self.guard.lock().await;
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let value = Arc::new(load().await?);
        self.store(value.clone());
        Ok(value)
    }

    /// 既存の値に関係なく読み込み直す
    ///
    /// 失敗した場合は以前の値がそのまま残る。
    pub async fn replace_with<F, Fut, E>(&self, load: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _guard = self.guard.lock().await;
        let value = Arc::new(load().await?);
        self.store(value.clone());
        Ok(value)
    }
}
