fn main() {
    campaign_pipeline::cli::run();
}
