//! Provider 名称到 GUID 的解析能力
//!
//! 名称解析依赖平台的事件发布者注册表，核心代码只面向这里的 capability
//! 接口；没有发布者注册表的平台使用永远解析不到的空实现。
//! 解析出的镜像路径只用于提示显示，扫描本身从不信任它。
use anyhow::Result;

use crate::guid::Identifier;

/// 解析结果：GUID 与发布者登记的镜像路径
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub identifier: Identifier,
    pub image_path: Option<String>,
}

/// 名称解析接口
pub trait ProviderResolver {
    /// 查找 provider 名称；查不到时返回 Ok(None)
    fn lookup(&self, name: &str) -> Result<Option<ResolvedProvider>>;
}

/// 空实现：没有发布者注册表的平台
pub struct NullResolver;

impl ProviderResolver for NullResolver {
    fn lookup(&self, _name: &str) -> Result<Option<ResolvedProvider>> {
        Ok(None)
    }
}

#[cfg(windows)]
pub use registry::RegistryResolver;

#[cfg(windows)]
mod registry {
    use anyhow::{Context, Result};
    use winreg::enums::HKEY_LOCAL_MACHINE;
    use winreg::RegKey;

    use super::{ProviderResolver, ResolvedProvider};
    use crate::guid::Identifier;

    const PUBLISHERS_KEY: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\WINEVT\Publishers";

    /// 基于 WINEVT\Publishers 注册表的解析器
    pub struct RegistryResolver;

    impl ProviderResolver for RegistryResolver {
        fn lookup(&self, name: &str) -> Result<Option<ResolvedProvider>> {
            let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
            let publishers = hklm
                .open_subkey(PUBLISHERS_KEY)
                .context("open WINEVT publishers key")?;

            // 发布者子键以 GUID 命名，默认值是 provider 名称
            for key_name in publishers.enum_keys().flatten() {
                let Ok(subkey) = publishers.open_subkey(&key_name) else {
                    continue;
                };
                let display_name: String = match subkey.get_value("") {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if !display_name.eq_ignore_ascii_case(name) {
                    continue;
                }
                let Ok(identifier) = Identifier::parse(&key_name) else {
                    continue;
                };
                let image_path: Option<String> = subkey.get_value("ResourceFileName").ok();
                return Ok(Some(ResolvedProvider {
                    identifier,
                    image_path,
                }));
            }
            Ok(None)
        }
    }
}

/// 当前平台的默认解析器
pub fn platform_resolver() -> Box<dyn ProviderResolver> {
    #[cfg(windows)]
    {
        Box::new(RegistryResolver)
    }
    #[cfg(not(windows))]
    {
        Box::new(NullResolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver;

    impl ProviderResolver for FixedResolver {
        fn lookup(&self, name: &str) -> Result<Option<ResolvedProvider>> {
            if name.eq_ignore_ascii_case("Microsoft-Windows-TaskScheduler") {
                Ok(Some(ResolvedProvider {
                    identifier: Identifier::parse("{de7b24ea-73c8-4a09-985d-5bdadcfa9017}")
                        .unwrap(),
                    image_path: Some(r"C:\Windows\System32\schedsvc.dll".to_string()),
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn resolver_is_usable_as_trait_object() {
        let resolver: Box<dyn ProviderResolver> = Box::new(FixedResolver);
        let resolved = resolver
            .lookup("microsoft-windows-taskscheduler")
            .unwrap()
            .unwrap();
        assert_eq!(
            resolved.identifier.to_string(),
            "{de7b24ea-73c8-4a09-985d-5bdadcfa9017}"
        );
        assert!(resolved.image_path.is_some());
        assert!(resolver.lookup("Some-Unknown-Provider").unwrap().is_none());
    }

    #[test]
    fn null_resolver_resolves_nothing() {
        assert!(NullResolver
            .lookup("Microsoft-Windows-TaskScheduler")
            .unwrap()
            .is_none());
    }
}
