use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;

use traffic_signs_lib::model::AppConfig;

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // 第1引数で設定ファイルを指定（省略時は ./config.json、なければデフォルト設定）
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default_from(&config_path);
    config.display();

    match traffic_signs_lib::run(&config) {
        Ok(summary) => {
            println!("モデル: {}", summary.model_path.display());
            println!("レポート: {} 件", summary.artifacts.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
